//! Remote call executor.
//!
//! Issues one HTTP request through the authenticated page by injecting a
//! synchronous `XMLHttpRequest`, so the call rides on the session's cookies.
//! A raw transport primitive: no caching, no retries, and no status
//! interpretation; the dispatcher decides what a status means.
//!
//! The browser context has a single set of cookies and navigation state, so
//! calls are serialized: at most one request is in flight at a time.

use std::sync::Arc;

use regex_lite::Regex;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::driver::PageDriver;
use crate::error::{Error, Result};

/// Default API origin the relative paths resolve against.
pub const DEFAULT_API_URL: &str = "https://pitangui.amazon.com";

/// Normalized outcome of one remote call.
#[derive(Debug, Clone)]
pub struct RemoteResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body_text: String,
    /// Present only when the declared content type is JSON and the body
    /// parses as such.
    pub body_json: Option<Value>,
    /// URL the request ended up at after redirects.
    pub final_url: Option<String>,
}

/// Payload of one outbound request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Structured payload, serialized and declared as `application/json`.
    Json(Value),
    /// Raw text forwarded byte-for-byte with no content type attached.
    Text(String),
}

pub struct RemoteCallExecutor {
    driver: Arc<dyn PageDriver>,
    api_url: String,
    // One in-flight remote call at a time.
    gate: Mutex<()>,
}

impl RemoteCallExecutor {
    pub fn new(driver: Arc<dyn PageDriver>, api_url: impl Into<String>) -> Self {
        Self {
            driver,
            api_url: api_url.into(),
            gate: Mutex::new(()),
        }
    }

    pub async fn get(&self, url: &str, vars: Option<&Value>) -> Result<RemoteResponse> {
        self.call("GET", url, None, vars).await
    }

    pub async fn post(&self, url: &str, body: &Value, vars: Option<&Value>) -> Result<RemoteResponse> {
        self.call("POST", url, Some(&RequestBody::Json(body.clone())), vars)
            .await
    }

    /// Issues one request through the page. Relative paths resolve against
    /// the configured API origin; `{{name}}` placeholders are substituted
    /// from `vars` first.
    pub async fn call(
        &self,
        method: &str,
        url: &str,
        body: Option<&RequestBody>,
        vars: Option<&Value>,
    ) -> Result<RemoteResponse> {
        let mut url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}{}", self.api_url, url)
        };
        if let Some(vars) = vars {
            url = render_template(&url, vars);
        }

        let method = method.to_uppercase();
        debug!(target: "alexa.remote", %method, %url, "remote call");

        let _serialized = self.gate.lock().await;
        let outcome = self.driver.evaluate(&xhr_script(&method, &url, body)).await?;
        parse_outcome(outcome)
    }
}

/// Substitutes `{{name}}` placeholders from a JSON object; unknown names
/// render as the empty string.
pub fn render_template(template: &str, vars: &Value) -> String {
    let pattern = Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap();
    pattern
        .replace_all(template, |caps: &regex_lite::Captures<'_>| {
            match vars.get(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            }
        })
        .into_owned()
}

fn xhr_script(method: &str, url: &str, body: Option<&RequestBody>) -> String {
    let (body_literal, content_type_literal) = match body {
        // Double-encoded: a JSON string whose contents are the JSON payload.
        Some(RequestBody::Json(value)) => (
            Value::String(value.to_string()).to_string(),
            "\"application/json\"".to_string(),
        ),
        // Verbatim: the text becomes the request body exactly as given.
        Some(RequestBody::Text(text)) => {
            (Value::String(text.clone()).to_string(), "null".to_string())
        }
        None => ("null".to_string(), "null".to_string()),
    };

    format!(
        r#"(() => {{
  const xhr = new XMLHttpRequest();
  xhr.open({method}, {url}, false);
  const body = {body};
  const contentType = {content_type};
  if (contentType !== null) xhr.setRequestHeader('Content-Type', contentType);
  try {{
    xhr.send(body);
  }} catch (e) {{
    return {{ transportError: String(e) }};
  }}
  return {{
    status: xhr.status,
    contentType: xhr.getResponseHeader('Content-Type'),
    responseText: xhr.responseText,
    finalUrl: xhr.responseURL,
  }};
}})()"#,
        method = Value::String(method.to_string()),
        url = Value::String(url.to_string()),
        body = body_literal,
        content_type = content_type_literal,
    )
}

fn parse_outcome(outcome: Value) -> Result<RemoteResponse> {
    if let Some(error) = outcome.get("transportError").and_then(Value::as_str) {
        return Err(Error::RemoteUnavailable(error.to_string()));
    }

    let status = outcome.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
    if status == 0 {
        return Err(Error::RemoteUnavailable("request never reached the server".to_string()));
    }

    let content_type = outcome
        .get("contentType")
        .and_then(Value::as_str)
        .map(str::to_string);
    let body_text = outcome
        .get("responseText")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let final_url = outcome
        .get("finalUrl")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string);

    let is_json = content_type
        .as_deref()
        .is_some_and(|ct| ct.contains("json"));
    let body_json = if is_json {
        serde_json::from_str(&body_text).ok()
    } else {
        None
    };

    Ok(RemoteResponse {
        status,
        content_type,
        body_text,
        body_json,
        final_url,
    })
}

/// Whether a response shows the session is no longer signed in: the remote
/// rejects the call outright or redirects it back to the sign-in page.
pub fn indicates_auth_failure(response: &RemoteResponse) -> bool {
    response.status == 401
        || response
            .final_url
            .as_deref()
            .is_some_and(|url| url.contains("/ap/signin"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn template_renders_device_vars() {
        let vars = json!({ "serialNumber": "G09", "deviceType": "A3S" });
        let rendered = render_template(
            "/api/np/player?deviceSerialNumber={{serialNumber}}&deviceType={{ deviceType }}",
            &vars,
        );
        assert_eq!(rendered, "/api/np/player?deviceSerialNumber=G09&deviceType=A3S");
    }

    #[test]
    fn template_leaves_unknown_names_empty() {
        let rendered = render_template("/x/{{missing}}/y", &json!({}));
        assert_eq!(rendered, "/x//y");
    }

    #[test]
    fn xhr_script_encodes_json_body_once_as_string() {
        let body = RequestBody::Json(json!({ "type": "PlayCommand" }));
        let script = xhr_script("POST", "https://x/api", Some(&body));
        assert!(script.contains(r#"xhr.open("POST", "https://x/api", false)"#));
        assert!(script.contains(r#"const body = "{\"type\":\"PlayCommand\"}";"#));
        assert!(script.contains(r#"const contentType = "application/json";"#));
    }

    #[test]
    fn xhr_script_sends_text_body_verbatim() {
        let body = RequestBody::Text("a=b&c=d".to_string());
        let script = xhr_script("POST", "https://x/api", Some(&body));
        assert!(script.contains(r#"const body = "a=b&c=d";"#));
        assert!(script.contains("const contentType = null;"));
    }

    #[test]
    fn xhr_script_without_body_sends_null() {
        let script = xhr_script("GET", "https://x/api", None);
        assert!(script.contains("const body = null;"));
        assert!(script.contains("const contentType = null;"));
    }

    #[test]
    fn outcome_parses_json_when_declared() {
        let response = parse_outcome(json!({
            "status": 200,
            "contentType": "application/json;charset=UTF-8",
            "responseText": "{\"devices\":[]}",
            "finalUrl": "https://pitangui.amazon.com/api/devices/device",
        }))
        .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body_json, Some(json!({ "devices": [] })));
    }

    #[test]
    fn outcome_keeps_text_only_for_non_json() {
        let response = parse_outcome(json!({
            "status": 200,
            "contentType": "text/html",
            "responseText": "{\"devices\":[]}",
        }))
        .unwrap();

        assert!(response.body_json.is_none());
        assert_eq!(response.body_text, "{\"devices\":[]}");
    }

    #[test]
    fn transport_error_maps_to_remote_unavailable() {
        let err = parse_outcome(json!({ "transportError": "NetworkError" })).unwrap_err();
        assert!(matches!(err, Error::RemoteUnavailable(_)));

        let err = parse_outcome(json!({ "status": 0, "responseText": "" })).unwrap_err();
        assert!(matches!(err, Error::RemoteUnavailable(_)));
    }

    #[test]
    fn auth_failure_detection() {
        let ok = RemoteResponse {
            status: 200,
            content_type: None,
            body_text: String::new(),
            body_json: None,
            final_url: Some("https://pitangui.amazon.com/api/x".to_string()),
        };
        assert!(!indicates_auth_failure(&ok));

        let unauthorized = RemoteResponse { status: 401, ..ok.clone() };
        assert!(indicates_auth_failure(&unauthorized));

        let redirected = RemoteResponse {
            final_url: Some("https://www.amazon.com/ap/signin?x=1".to_string()),
            ..ok
        };
        assert!(indicates_auth_failure(&redirected));
    }
}
