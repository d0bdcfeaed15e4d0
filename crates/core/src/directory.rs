//! TTL-bounded device directory.
//!
//! Maps slugified device names to the remote descriptors behind them. The
//! directory is only ever replaced wholesale, never patched, so readers see
//! either the old epoch or the new one. One lock covers both lookup and
//! refresh, which also guarantees at most one refresh in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::executor::{self, RemoteCallExecutor};

const DEVICE_LIST_PATH: &str = "/api/devices/device";

/// Default directory lifetime, matching the upstream web app's cadence.
pub const DEFAULT_CACHE_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Remote-provided record describing one controllable device. Fields beyond
/// the three the engine needs pass through opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub account_name: String,
    pub serial_number: String,
    pub device_type: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct DeviceListResponse {
    devices: Vec<DeviceDescriptor>,
}

/// One immutable epoch of the device directory.
#[derive(Debug)]
pub struct Directory {
    pub devices: HashMap<String, DeviceDescriptor>,
    fetched_at: Instant,
}

impl Directory {
    fn is_fresh(&self, ttl: Duration) -> bool {
        !self.devices.is_empty() && self.fetched_at.elapsed() < ttl
    }
}

pub struct DeviceCache {
    executor: Arc<RemoteCallExecutor>,
    ttl: Duration,
    current: Mutex<Option<Arc<Directory>>>,
}

impl DeviceCache {
    pub fn new(executor: Arc<RemoteCallExecutor>, ttl: Duration) -> Self {
        Self {
            executor,
            ttl,
            current: Mutex::new(None),
        }
    }

    /// Returns the device directory, refreshing it first when it is empty,
    /// stale, or `force` is set.
    pub async fn devices(&self, force: bool) -> Result<Arc<Directory>> {
        let mut slot = self.current.lock().await;

        if !force {
            if let Some(directory) = slot.as_ref() {
                if directory.is_fresh(self.ttl) {
                    let left = self.ttl.saturating_sub(directory.fetched_at.elapsed());
                    debug!(
                        target: "alexa.directory",
                        expires_in_secs = left.as_secs(),
                        "serving cached device directory"
                    );
                    return Ok(Arc::clone(directory));
                }
            }
        }

        let directory = Arc::new(self.fetch().await?);
        *slot = Some(Arc::clone(&directory));
        Ok(directory)
    }

    /// Resolves one device by identifier; `None` when unknown.
    pub async fn device(&self, id: &str, force: bool) -> Result<Option<DeviceDescriptor>> {
        Ok(self.devices(force).await?.devices.get(id).cloned())
    }

    async fn fetch(&self) -> Result<Directory> {
        let response = self.executor.get(DEVICE_LIST_PATH, None).await?;
        if executor::indicates_auth_failure(&response) {
            return Err(Error::AuthenticationRequired);
        }

        let body = response
            .body_json
            .ok_or_else(|| Error::RemoteUnavailable("device list response was not JSON".to_string()))?;
        let listing: DeviceListResponse = serde_json::from_value(body)?;

        let mut devices = HashMap::new();
        for descriptor in listing.devices {
            let slug = slugify(&descriptor.account_name);
            if devices.contains_key(&slug) {
                // Last-write-wins in list order; collisions only get a log line.
                debug!(target: "alexa.directory", %slug, "device name collision, keeping later entry");
            }
            devices.insert(slug, descriptor);
        }

        debug!(target: "alexa.directory", count = devices.len(), "device directory refreshed");
        Ok(Directory {
            devices,
            fetched_at: Instant::now(),
        })
    }
}

/// Derives the public device identifier from a display name: lowercased,
/// spaces to hyphens, everything outside `[a-z0-9-]` stripped.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c == ' ' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}
