//! Chrome DevTools Protocol driver.
//!
//! Request/response correlation over a WebSocket: commands get sequential
//! ids and a oneshot callback; unsolicited messages are protocol events.
//! Top-level frame navigations and load completions are folded into
//! [`PageLoad`] events for the session machine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, warn};

use super::{PageDriver, PageLoad};
use crate::error::{Error, Result};

/// Connection options for [`CdpDriver::connect`].
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// CDP endpoint: `http(s)://host:port` for discovery via `/json/list`,
    /// or a `ws(s)://` page-target URL to attach to directly.
    pub cdp_endpoint: String,
    pub user_agent: Option<String>,
    pub viewport: Option<Viewport>,
}

#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

type Callbacks = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// [`PageDriver`] implementation attached to one browser page target.
pub struct CdpDriver {
    outgoing: mpsc::UnboundedSender<WsMessage>,
    callbacks: Callbacks,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<PageLoad>,
}

impl CdpDriver {
    /// Attaches to a page target and returns the driver plus the stream of
    /// page-load events observed on it.
    pub async fn connect(
        options: &DriverOptions,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<PageLoad>)> {
        let ws_url = resolve_page_ws(&options.cdp_endpoint).await?;
        debug!(target: "alexa.driver", %ws_url, "attaching to page target");

        let (stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| Error::Driver(format!("WebSocket connect failed: {e}")))?;
        let (mut write, mut read) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<PageLoad>();
        let callbacks: Callbacks = Arc::new(Mutex::new(HashMap::new()));

        // Writer task: serializes all outgoing traffic onto the socket.
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if write.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: correlates responses and folds navigation events.
        let reader_callbacks = Arc::clone(&callbacks);
        let reader_events = event_tx.clone();
        tokio::spawn(async move {
            let mut last_url = String::new();
            while let Some(message) = read.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        dispatch(&reader_callbacks, &reader_events, &mut last_url, &text).await;
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(target: "alexa.driver", error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
            // Wake anyone still waiting on a reply.
            reader_callbacks.lock().await.clear();
            debug!(target: "alexa.driver", "connection closed");
        });

        let driver = Arc::new(Self {
            outgoing: out_tx,
            callbacks,
            next_id: AtomicU64::new(1),
            events: event_tx,
        });

        driver.command("Page.enable", json!({})).await?;
        if let Some(user_agent) = &options.user_agent {
            driver
                .command("Network.setUserAgentOverride", json!({ "userAgent": user_agent }))
                .await?;
        }
        if let Some(viewport) = options.viewport {
            driver
                .command(
                    "Emulation.setDeviceMetricsOverride",
                    json!({
                        "width": viewport.width,
                        "height": viewport.height,
                        "deviceScaleFactor": 1,
                        "mobile": false,
                    }),
                )
                .await?;
        }

        Ok((driver, event_rx))
    }

    /// Sends one protocol command and awaits its response.
    async fn command(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.callbacks.lock().await.insert(id, tx);

        let payload = json!({ "id": id, "method": method, "params": params });
        self.outgoing
            .send(WsMessage::Text(payload.to_string()))
            .map_err(|_| Error::Driver("browser connection closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Driver("browser connection closed before reply".to_string()))?
    }
}

#[async_trait]
impl PageDriver for CdpDriver {
    async fn goto(&self, url: &str) -> Result<()> {
        debug!(target: "alexa.driver", %url, "navigate");
        let result = self.command("Page.navigate", json!({ "url": url })).await?;

        if let Some(text) = result.get("errorText").and_then(Value::as_str) {
            if !text.is_empty() {
                warn!(target: "alexa.driver", %url, error = text, "navigation failed");
                let _ = self.events.send(PageLoad { url: url.to_string(), ok: false });
            }
        }
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .command(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .pointer("/exception/description")
                .and_then(Value::as_str)
                .or_else(|| details.get("text").and_then(Value::as_str))
                .unwrap_or("evaluation failed");
            return Err(Error::Driver(text.to_string()));
        }

        Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
    }

    async fn fill(&self, form_selector: &str, fields: &Value, submit: bool) -> Result<()> {
        match self.evaluate(&fill_script(form_selector, fields, submit)).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(Error::Driver(format!("no form matches {form_selector}"))),
        }
    }

    async fn capture_selector(&self, path: &Path, selector: &str) -> Result<()> {
        let rect = self.evaluate(&rect_probe_script(selector)).await?;
        if rect.is_null() {
            return Err(Error::Driver(format!("no element matches {selector}")));
        }

        let shot = self
            .command(
                "Page.captureScreenshot",
                json!({
                    "format": "png",
                    "clip": {
                        "x": rect["x"],
                        "y": rect["y"],
                        "width": rect["width"],
                        "height": rect["height"],
                        "scale": 1,
                    },
                }),
            )
            .await?;

        let data = shot
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Driver("screenshot returned no data".to_string()))?;
        let bytes = BASE64_STANDARD
            .decode(data)
            .map_err(|e| Error::Driver(format!("invalid screenshot payload: {e}")))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, bytes).await?;
        debug!(target: "alexa.driver", path = %path.display(), %selector, "captured selector");
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        self.evaluate("window.location.href")
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Driver("location.href was not a string".to_string()))
    }
}

/// Routes one incoming protocol message to its callback or event handling.
async fn dispatch(
    callbacks: &Callbacks,
    events: &mpsc::UnboundedSender<PageLoad>,
    last_url: &mut String,
    text: &str,
) {
    let message: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(target: "alexa.driver", error = %e, "unparseable protocol message");
            return;
        }
    };

    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        let Some(callback) = callbacks.lock().await.remove(&id) else {
            debug!(target: "alexa.driver", id, "response with no pending request");
            return;
        };
        let result = match message.get("error") {
            Some(error) => Err(Error::Driver(
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown protocol error")
                    .to_string(),
            )),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = callback.send(result);
        return;
    }

    match message.get("method").and_then(Value::as_str) {
        // Track the main frame URL so load events can carry it.
        Some("Page.frameNavigated") => {
            let frame = &message["params"]["frame"];
            if frame.get("parentId").is_none() {
                if let Some(url) = frame.get("url").and_then(Value::as_str) {
                    *last_url = url.to_string();
                }
            }
        }
        Some("Page.loadEventFired") => {
            let _ = events.send(PageLoad { url: last_url.clone(), ok: true });
        }
        _ => {}
    }
}

fn fill_script(form_selector: &str, fields: &Value, submit: bool) -> String {
    format!(
        r#"(() => {{
  const form = document.querySelector({form});
  if (!form) return false;
  const fields = {fields};
  for (const [name, value] of Object.entries(fields)) {{
    const el = form.elements.namedItem(name);
    if (!el) continue;
    if (el.type === 'checkbox') el.checked = !!value;
    else el.value = String(value);
  }}
  if ({submit}) form.submit();
  return true;
}})()"#,
        form = Value::String(form_selector.to_string()),
        fields = fields,
        submit = submit,
    )
}

fn rect_probe_script(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({selector});
  if (!el) return null;
  const r = el.getBoundingClientRect();
  return {{ x: r.x, y: r.y, width: r.width, height: r.height }};
}})()"#,
        selector = Value::String(selector.to_string()),
    )
}

/// One entry of the `/json/list` target listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CdpTarget {
    #[serde(rename = "type", default)]
    kind: String,
    web_socket_debugger_url: Option<String>,
}

/// Resolves a page-target WebSocket URL from the configured endpoint.
async fn resolve_page_ws(endpoint: &str) -> Result<String> {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return Ok(endpoint.to_string());
    }

    let base = endpoint.trim_end_matches('/');
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| Error::Driver(format!("failed to create HTTP client: {e}")))?;

    let targets: Vec<CdpTarget> = client
        .get(format!("{base}/json/list"))
        .send()
        .await
        .map_err(|e| Error::Driver(format!("failed to reach CDP endpoint {base}: {e}")))?
        .json()
        .await
        .map_err(|e| Error::Driver(format!("failed to parse CDP target list: {e}")))?;

    if let Some(ws) = targets
        .iter()
        .find(|target| target.kind == "page")
        .and_then(|target| target.web_socket_debugger_url.clone())
    {
        return Ok(ws);
    }

    // No open page; ask the browser to create one.
    let created: CdpTarget = client
        .put(format!("{base}/json/new?about:blank"))
        .send()
        .await
        .map_err(|e| Error::Driver(format!("failed to create page target: {e}")))?
        .json()
        .await
        .map_err(|e| Error::Driver(format!("failed to parse created target: {e}")))?;

    created
        .web_socket_debugger_url
        .ok_or_else(|| Error::Driver("no debuggable page target available".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_script_embeds_fields_as_json() {
        let fields = json!({ "email": "user@example.com", "rememberMe": true });
        let script = fill_script("form[name=\"signIn\"]", &fields, true);

        assert!(script.contains(r#"document.querySelector("form[name=\"signIn\"]")"#));
        assert!(script.contains(r#""email":"user@example.com""#));
        assert!(script.contains(r#""rememberMe":true"#));
        assert!(script.contains("if (true) form.submit();"));
    }

    #[test]
    fn fill_script_without_submit() {
        let script = fill_script("#login", &json!({}), false);
        assert!(script.contains("if (false) form.submit();"));
    }

    #[test]
    fn rect_probe_quotes_selector() {
        let script = rect_probe_script("#auth-captcha-image");
        assert!(script.contains(r##"document.querySelector("#auth-captcha-image")"##));
    }

    #[test]
    fn target_listing_deserializes() {
        let listing = r#"[
            {"type": "background_page", "webSocketDebuggerUrl": "ws://x/1"},
            {"type": "page", "webSocketDebuggerUrl": "ws://x/2"}
        ]"#;
        let targets: Vec<CdpTarget> = serde_json::from_str(listing).unwrap();
        let page = targets.iter().find(|t| t.kind == "page").unwrap();
        assert_eq!(page.web_socket_debugger_url.as_deref(), Some("ws://x/2"));
    }

    #[tokio::test]
    async fn dispatch_correlates_response_by_id() {
        let callbacks: Callbacks = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        callbacks.lock().await.insert(7, tx);

        let mut last_url = String::new();
        dispatch(
            &callbacks,
            &event_tx,
            &mut last_url,
            r#"{"id": 7, "result": {"frameId": "abc"}}"#,
        )
        .await;

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result["frameId"], "abc");
    }

    #[tokio::test]
    async fn dispatch_surfaces_protocol_errors() {
        let callbacks: Callbacks = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        callbacks.lock().await.insert(3, tx);

        let mut last_url = String::new();
        dispatch(
            &callbacks,
            &event_tx,
            &mut last_url,
            r#"{"id": 3, "error": {"code": -32000, "message": "Cannot navigate"}}"#,
        )
        .await;

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Driver(message) if message == "Cannot navigate"));
    }

    #[tokio::test]
    async fn load_event_carries_last_main_frame_url() {
        let callbacks: Callbacks = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut last_url = String::new();

        dispatch(
            &callbacks,
            &event_tx,
            &mut last_url,
            r#"{"method": "Page.frameNavigated", "params": {"frame": {"id": "f1", "url": "https://alexa.amazon.com/"}}}"#,
        )
        .await;
        dispatch(
            &callbacks,
            &event_tx,
            &mut last_url,
            r#"{"method": "Page.loadEventFired", "params": {"timestamp": 1.0}}"#,
        )
        .await;

        let load = event_rx.recv().await.unwrap();
        assert_eq!(load, PageLoad { url: "https://alexa.amazon.com/".to_string(), ok: true });
    }

    #[tokio::test]
    async fn subframe_navigation_does_not_move_main_url() {
        let callbacks: Callbacks = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut last_url = "https://alexa.amazon.com/".to_string();

        dispatch(
            &callbacks,
            &event_tx,
            &mut last_url,
            r#"{"method": "Page.frameNavigated", "params": {"frame": {"id": "f2", "parentId": "f1", "url": "https://ads.example.com/"}}}"#,
        )
        .await;
        dispatch(
            &callbacks,
            &event_tx,
            &mut last_url,
            r#"{"method": "Page.loadEventFired", "params": {"timestamp": 2.0}}"#,
        )
        .await;

        let load = event_rx.recv().await.unwrap();
        assert_eq!(load.url, "https://alexa.amazon.com/");
    }
}
