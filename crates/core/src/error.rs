use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the session and device-control engine.
#[derive(Debug, Error)]
pub enum Error {
    /// No device in the directory matches the requested identifier.
    #[error("unknown device: {0}")]
    NotFound(String),

    /// The remote service could not be reached or returned garbage.
    #[error("remote service unavailable: {0}")]
    RemoteUnavailable(String),

    /// The remote call indicated the browser session is no longer signed in.
    #[error("session is not authenticated")]
    AuthenticationRequired,

    /// The login flow is blocked on a human-supplied captcha answer.
    #[error("login is waiting on a captcha answer")]
    CaptchaRequired,

    /// Browser navigation did not complete successfully.
    #[error("page load failed: {0}")]
    PageLoadFailed(String),

    /// The browser automation transport misbehaved.
    #[error("browser driver error: {0}")]
    Driver(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
