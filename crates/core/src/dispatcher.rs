//! Command dispatcher: the public-facing API over the device directory and
//! the remote call executor. Turns high-level intents into authenticated
//! remote calls and normalizes their responses.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::directory::{DeviceCache, DeviceDescriptor, Directory};
use crate::error::{Error, Result};
use crate::executor::{self, RemoteCallExecutor, RemoteResponse, RequestBody};
use crate::session::{SessionMachine, SessionState};

const PLAYER_PATH: &str =
    "/api/np/player?deviceSerialNumber={{serialNumber}}&deviceType={{deviceType}}";
const COMMAND_PATH: &str =
    "/api/np/command?deviceSerialNumber={{serialNumber}}&deviceType={{deviceType}}";

pub struct Dispatcher {
    cache: DeviceCache,
    executor: Arc<RemoteCallExecutor>,
    session: Arc<Mutex<SessionMachine>>,
}

impl Dispatcher {
    pub fn new(
        cache: DeviceCache,
        executor: Arc<RemoteCallExecutor>,
        session: Arc<Mutex<SessionMachine>>,
    ) -> Self {
        Self { cache, executor, session }
    }

    /// Returns the full device directory, optionally forcing a refresh.
    pub async fn devices(&self, force: bool) -> Result<Arc<Directory>> {
        self.guard().await?;
        self.observe(self.cache.devices(force).await)
    }

    /// Returns a single device descriptor; `NotFound` when the id is unknown.
    pub async fn device(&self, id: &str) -> Result<DeviceDescriptor> {
        self.guard().await?;
        self.observe(self.cache.device(id, false).await)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Returns the device's current player info.
    pub async fn player(&self, id: &str) -> Result<Value> {
        let device = self.device(id).await?;
        self.player_for(&device).await
    }

    pub async fn play(&self, id: &str) -> Result<Value> {
        self.command_then_player(id, json!({ "type": "PlayCommand" })).await
    }

    pub async fn pause(&self, id: &str) -> Result<Value> {
        self.command_then_player(id, json!({ "type": "PauseCommand" })).await
    }

    /// Returns the player's current volume level.
    pub async fn volume(&self, id: &str) -> Result<Value> {
        Ok(self.player(id).await?.get("volume").cloned().unwrap_or(Value::Null))
    }

    /// Sets the volume and returns the level the player reports afterwards.
    pub async fn set_volume(&self, id: &str, level: u8) -> Result<Value> {
        let player = self
            .command_then_player(
                id,
                json!({ "type": "VolumeLevelCommand", "volumeLevel": level }),
            )
            .await?;
        Ok(player.get("volume").cloned().unwrap_or(Value::Null))
    }

    /// Forwards an arbitrary call verbatim to the remote API. The catch-all
    /// for endpoints not otherwise modeled; the body travels untouched.
    pub async fn passthrough(
        &self,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> Result<RemoteResponse> {
        self.guard().await?;
        debug!(target: "alexa.dispatch", %method, %path, "passthrough");
        let body = body.map(|text| RequestBody::Text(text.to_string()));
        let response = self
            .observe(self.executor.call(method, path, body.as_ref(), None).await)?;
        if executor::indicates_auth_failure(&response) {
            return self.observe(Err(Error::AuthenticationRequired));
        }
        Ok(response)
    }

    async fn command_then_player(&self, id: &str, payload: Value) -> Result<Value> {
        let device = self.device(id).await?;
        let vars = serde_json::to_value(&device)?;

        let response = self
            .observe(self.executor.post(COMMAND_PATH, &payload, Some(&vars)).await)?;
        if executor::indicates_auth_failure(&response) {
            return self.observe(Err(Error::AuthenticationRequired));
        }

        self.player_for(&device).await
    }

    async fn player_for(&self, device: &DeviceDescriptor) -> Result<Value> {
        let vars = serde_json::to_value(device)?;
        let response = self.observe(self.executor.get(PLAYER_PATH, Some(&vars)).await)?;
        if executor::indicates_auth_failure(&response) {
            return self.observe(Err(Error::AuthenticationRequired));
        }

        response
            .body_json
            .as_ref()
            .and_then(|body| body.get("playerInfo"))
            .cloned()
            .ok_or_else(|| {
                Error::RemoteUnavailable("player response carried no playerInfo".to_string())
            })
    }

    /// Fails fast when the session cannot serve remote calls. A pending
    /// captcha is surfaced only through the assist endpoints, so callers
    /// here just learn that authentication is required.
    async fn guard(&self) -> Result<()> {
        match self.session.lock().await.state() {
            SessionState::Authenticated => Ok(()),
            SessionState::CaptchaPending => Err(Error::AuthenticationRequired),
            _ => Err(Error::AuthenticationRequired),
        }
    }

    /// Watches operation outcomes for authentication failures and re-enters
    /// the login flow when one shows up. The in-flight caller still gets
    /// the error; clients retry after re-auth completes.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(Error::AuthenticationRequired)) {
            warn!(target: "alexa.dispatch", "remote call lost authentication");
            let session = Arc::clone(&self.session);
            tokio::spawn(async move {
                let mut session = session.lock().await;
                if session.state() == SessionState::Authenticated {
                    if let Err(e) = session.restart().await {
                        warn!(target: "alexa.dispatch", error = %e, "failed to restart login flow");
                    }
                }
            });
        }
        result
    }
}
