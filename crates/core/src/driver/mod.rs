//! Browser automation boundary.
//!
//! The engine never talks to the browser directly; everything goes through
//! the [`PageDriver`] trait so the session machine, executor and tests can
//! share one seam. The production implementation is [`CdpDriver`], a thin
//! Chrome DevTools Protocol client over a WebSocket.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

mod cdp;

pub use cdp::{CdpDriver, DriverOptions, Viewport};

/// Observed completion of a top-level page load.
///
/// Session state transitions are driven by these events, never by assuming
/// the outcome of a navigation or form submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLoad {
    pub url: String,
    pub ok: bool,
}

/// Capability surface the engine needs from the browser substrate.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Starts navigation to `url`. Fire-and-forget: completion is reported
    /// through a [`PageLoad`] event, not through this return value.
    async fn goto(&self, url: &str) -> Result<()>;

    /// Evaluates a JavaScript expression in the page and returns its value.
    async fn evaluate(&self, expression: &str) -> Result<Value>;

    /// Fills the form matching `form_selector` with `fields` (keyed by input
    /// name) and optionally submits it.
    async fn fill(&self, form_selector: &str, fields: &Value, submit: bool) -> Result<()>;

    /// Captures a screenshot of the element matching `selector` to `path`.
    async fn capture_selector(&self, path: &Path, selector: &str) -> Result<()>;

    /// Returns the page's current URL.
    async fn current_url(&self) -> Result<String>;
}
