//! HTTP front door.
//!
//! Thin routing over the dispatcher plus the captcha-assist endpoints. Any
//! path the router does not know is passed through verbatim to the remote
//! API with the remote's status, content type and body mirrored back.

use std::path::PathBuf;
use std::sync::Arc;

use alexa::{Dispatcher, Error, SessionMachine};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Form, OriginalUri, Path, Query, State},
    http::{HeaderValue, Method, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub session: Arc<Mutex<SessionMachine>>,
    pub assist_url: String,
    pub screenshot: PathBuf,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/devices", get(list_devices))
        .route("/device/{id}", get(get_device))
        .route("/device/{id}/status", get(device_status))
        .route("/device/{id}/play", get(device_play))
        .route("/device/{id}/pause", get(device_pause))
        .route("/device/{id}/volume", get(device_volume))
        .route("/device/{id}/volume/{level}", get(device_set_volume))
        .route("/human", get(human_form).post(human_submit))
        .route("/captcha.png", get(captcha_image))
        .fallback(passthrough)
        .with_state(state)
}

async fn index() -> Redirect {
    Redirect::temporary("/devices")
}

#[derive(Deserialize)]
struct RefreshQuery {
    refresh: Option<String>,
}

async fn list_devices(
    State(state): State<AppState>,
    Query(params): Query<RefreshQuery>,
) -> Response {
    let force = params.refresh.as_deref() == Some("true");
    match state.dispatcher.devices(force).await {
        Ok(directory) => Json(&directory.devices).into_response(),
        Err(error) => failure(&state, error),
    }
}

async fn get_device(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.dispatcher.device(&id).await {
        Ok(descriptor) => Json(descriptor).into_response(),
        Err(error) => failure(&state, error),
    }
}

async fn device_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.dispatcher.player(&id).await {
        Ok(player) => Json(player).into_response(),
        Err(error) => failure(&state, error),
    }
}

async fn device_play(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.dispatcher.play(&id).await {
        Ok(player) => Json(player).into_response(),
        Err(error) => failure(&state, error),
    }
}

async fn device_pause(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.dispatcher.pause(&id).await {
        Ok(player) => Json(player).into_response(),
        Err(error) => failure(&state, error),
    }
}

async fn device_volume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.dispatcher.volume(&id).await {
        Ok(volume) => Json(volume).into_response(),
        Err(error) => failure(&state, error),
    }
}

async fn device_set_volume(
    State(state): State<AppState>,
    Path((id, level)): Path<(String, u8)>,
) -> Response {
    if level > 100 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "bad_request", "message": "volume must be 0-100" })),
        )
            .into_response();
    }
    match state.dispatcher.set_volume(&id, level).await {
        Ok(volume) => Json(volume).into_response(),
        Err(error) => failure(&state, error),
    }
}

const HUMAN_FORM: &str = r#"<form method="post" action="/human">
<div><img src="/captcha.png"></div>
<div><input type="text" autocomplete="off" placeholder="Type the characters above" name="guess" autocorrect="off" autocapitalize="off" size="35"></div>
<div><input type="submit" value="Submit"></div>
</form>"#;

async fn human_form() -> Html<&'static str> {
    Html(HUMAN_FORM)
}

#[derive(Deserialize)]
struct GuessForm {
    guess: String,
}

async fn human_submit(
    State(state): State<AppState>,
    Form(form): Form<GuessForm>,
) -> Response {
    match state.session.lock().await.submit_guess(&form.guess).await {
        Ok(()) => "Thanks! You can close this window now.".into_response(),
        Err(error) => failure(&state, error),
    }
}

async fn captcha_image(State(state): State<AppState>) -> Response {
    match tokio::fs::read(&state.screenshot).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_found", "message": "no captcha screenshot available" })),
        )
            .into_response(),
    }
}

/// Catch-all: forward the request verbatim to the remote API and mirror the
/// remote's response back to the client.
async fn passthrough(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Response {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    debug!(target: "alexa.rest", method = %method, %path, "passthrough request");

    // The body travels verbatim; the dispatcher never reinterprets it.
    let body_text = if body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&body).into_owned())
    };

    match state
        .dispatcher
        .passthrough(method.as_str(), &path, body_text.as_deref())
        .await
    {
        Ok(remote) => {
            let status = StatusCode::from_u16(remote.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = match remote.body_json {
                Some(body) => (status, Json(body)).into_response(),
                None => (status, remote.body_text).into_response(),
            };
            if let Some(content_type) = remote
                .content_type
                .as_deref()
                .and_then(|ct| HeaderValue::from_str(ct).ok())
            {
                response.headers_mut().insert(header::CONTENT_TYPE, content_type);
            }
            response
        }
        Err(error) => failure(&state, error),
    }
}

/// Maps engine errors onto structured JSON error responses. The process
/// never crashes on a request; captcha trouble points the caller at the
/// assist URL.
fn failure(state: &AppState, error: Error) -> Response {
    let (status, kind) = match &error {
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        Error::AuthenticationRequired | Error::CaptchaRequired => {
            (StatusCode::SERVICE_UNAVAILABLE, "authentication_required")
        }
        Error::RemoteUnavailable(_) | Error::PageLoadFailed(_) | Error::Driver(_) => {
            (StatusCode::BAD_GATEWAY, "remote_unavailable")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };

    let message = match &error {
        Error::AuthenticationRequired | Error::CaptchaRequired => {
            format!("{error}; if a captcha is pending, visit {}", state.assist_url)
        }
        _ => error.to_string(),
    };

    (status, Json(json!({ "error": kind, "message": message }))).into_response()
}
