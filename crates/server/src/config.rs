//! Startup configuration.
//!
//! A single JSON file merged over built-in defaults: any key left out of
//! the file keeps its default, so a minimal config only needs the Amazon
//! credentials.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_12_5) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/59.0.3071.115 Safari/537.36";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub amazon: AmazonConfig,
    pub server: ServerConfig,
    pub browser: BrowserConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AmazonConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Where the captcha screenshot gets written and served from.
    pub screenshot: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2539,
            screenshot: "captcha.png".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// CDP endpoint of the browser that holds the session.
    pub cdp_endpoint: String,
    pub user_agent: String,
    pub viewport: ViewportConfig,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            cdp_endpoint: "http://127.0.0.1:9222".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            viewport: ViewportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self { width: 1280, height: 720 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub cache_lifetime_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: alexa::executor::DEFAULT_API_URL.to_string(),
            cache_lifetime_secs: 30 * 60,
        }
    }
}

impl Config {
    /// Loads the config file, or plain defaults when no path is given and
    /// `./config.json` does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => match std::fs::read_to_string("config.json") {
                Ok(text) => {
                    serde_json::from_str(&text).context("failed to parse config.json")?
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
                Err(e) => return Err(e).context("failed to read config.json"),
            },
        };
        Ok(config)
    }

    /// Credentials are the one thing that cannot be defaulted.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.amazon.username.is_empty() || self.amazon.password.is_empty() {
            anyhow::bail!("Amazon credentials not set (amazon.username / amazon.password)");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// URL a human visits to answer a captcha.
    pub fn assist_url(&self) -> String {
        format!("http://{}/human", self.bind_addr())
    }

    pub fn cache_lifetime(&self) -> Duration {
        Duration::from_secs(self.api.cache_lifetime_secs)
    }
}
