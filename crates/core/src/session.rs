//! Login state machine for the authenticated browser session.
//!
//! One session exists per process. All transitions are driven by observed
//! [`PageLoad`] events; navigation and form submission are fire-and-forget
//! signals into the driver. A captcha parks the machine until a human
//! submits a guess through the assist endpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::driver::{PageDriver, PageLoad};
use crate::error::Result;

const SIGN_IN_URL_FRAGMENT: &str = "www.amazon.com/ap/signin";
const SPA_URL_FRAGMENT: &str = "www.amazon.com/spa/index.html";
const SIGN_IN_FORM: &str = "form[name=\"signIn\"]";
const CAPTCHA_PROBE: &str = "!!document.getElementById('auth-captcha-guess')";
const CAPTCHA_IMAGE_SELECTOR: &str = "#auth-captcha-image";

/// Root of the authenticated application; also the start page for login.
pub const APP_ROOT_URL: &str = "https://alexa.amazon.com/";

/// Amazon account credentials used to drive the sign-in form.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    CheckingCaptcha,
    CaptchaPending,
    LoginSubmitted,
    Authenticated,
}

pub struct SessionMachine {
    driver: Arc<dyn PageDriver>,
    credentials: Credentials,
    screenshot: PathBuf,
    /// URL a human visits to answer a captcha, shown in the logs.
    assist_url: String,
    state: SessionState,
}

impl SessionMachine {
    pub fn new(
        driver: Arc<dyn PageDriver>,
        credentials: Credentials,
        screenshot: PathBuf,
        assist_url: String,
    ) -> Self {
        Self {
            driver,
            credentials,
            screenshot,
            assist_url,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Path the captcha screenshot is written to when a captcha appears.
    pub fn screenshot_path(&self) -> &Path {
        &self.screenshot
    }

    /// Kicks off the login flow by loading the application root. Amazon
    /// redirects to the sign-in page when the session has no valid cookies.
    pub async fn start(&mut self) -> Result<()> {
        info!(target: "alexa.session", url = APP_ROOT_URL, "starting login flow");
        self.state = SessionState::Unauthenticated;
        self.driver.goto(APP_ROOT_URL).await
    }

    /// Re-enters the login flow after a remote call observed an
    /// authentication failure.
    pub async fn restart(&mut self) -> Result<()> {
        warn!(target: "alexa.session", "session lost; re-entering login flow");
        self.start().await
    }

    /// Advances the machine on an observed page-load completion.
    pub async fn on_page_loaded(&mut self, load: &PageLoad) -> Result<()> {
        if !load.ok {
            warn!(target: "alexa.session", url = %load.url, "page load failed; waiting for operator");
            return Ok(());
        }

        if load.url.contains(SIGN_IN_URL_FRAGMENT) {
            self.check_captcha().await
        } else if load.url.contains(SPA_URL_FRAGMENT) {
            // Sign-in succeeded; move to the application root.
            info!(target: "alexa.session", "login complete");
            self.state = SessionState::Authenticated;
            self.driver.goto(APP_ROOT_URL).await
        } else {
            debug!(target: "alexa.session", url = %load.url, state = ?self.state, "page loaded");
            Ok(())
        }
    }

    /// Feeds a human-supplied captcha answer into the sign-in form and
    /// removes the stale screenshot.
    pub async fn submit_guess(&mut self, guess: &str) -> Result<()> {
        if self.state != SessionState::CaptchaPending {
            warn!(target: "alexa.session", state = ?self.state, "captcha guess received while none pending");
        }

        if let Err(e) = std::fs::remove_file(&self.screenshot) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(target: "alexa.session", error = %e, "failed to remove captcha screenshot");
            }
        }

        self.submit_login(Some(guess)).await
    }

    async fn check_captcha(&mut self) -> Result<()> {
        self.state = SessionState::CheckingCaptcha;

        let requires_captcha = self
            .driver
            .evaluate(CAPTCHA_PROBE)
            .await?
            .as_bool()
            .unwrap_or(false);

        if requires_captcha {
            warn!(target: "alexa.session", "anti-robot check detected on the login form");
            warn!(target: "alexa.session", url = %self.assist_url, "open this URL in a browser to enter the captcha");
            self.driver
                .capture_selector(&self.screenshot, CAPTCHA_IMAGE_SELECTOR)
                .await?;
            self.state = SessionState::CaptchaPending;
            Ok(())
        } else {
            self.submit_login(None).await
        }
    }

    async fn submit_login(&mut self, guess: Option<&str>) -> Result<()> {
        let mut fields = json!({
            "email": self.credentials.username,
            "password": self.credentials.password,
            "rememberMe": true,
        });
        if let Some(guess) = guess {
            fields["guess"] = Value::String(guess.to_string());
        }

        info!(target: "alexa.session", with_guess = guess.is_some(), "submitting sign-in form");
        self.driver.fill(SIGN_IN_FORM, &fields, true).await?;
        self.state = SessionState::LoginSubmitted;
        Ok(())
    }
}
