/// Client configuration
use crate::error::{AuthError, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub project_id: String,
    pub base_url: String,
    #[serde(default)]
    pub publishable_client_key: Option<String>,
    #[serde(default)]
    pub cookies: CookieSettings,
    #[serde(default)]
    pub urls: HandlerUrls,
    /// Extra provider scopes requested on sign-in, keyed by provider id
    #[serde(default)]
    pub oauth_scopes_on_sign_in: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub requests: RequestSettings,
}

impl ClientConfig {
    pub fn new(project_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            base_url: base_url.into(),
            publishable_client_key: None,
            cookies: CookieSettings::default(),
            urls: HandlerUrls::default(),
            oauth_scopes_on_sign_in: BTreeMap::new(),
            requests: RequestSettings::default(),
        }
    }

    /// Space-separated provider scope for sign-in, if configured
    pub fn provider_scope(&self, provider: &str) -> Option<String> {
        self.oauth_scopes_on_sign_in
            .get(provider)
            .filter(|scopes| !scopes.is_empty())
            .map(|scopes| scopes.join(" "))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CookieSettings {
    #[serde(default = "default_cookie_prefix")]
    pub prefix: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_refresh_max_age_secs")]
    pub refresh_max_age_secs: u64,
    #[serde(default = "default_access_max_age_secs")]
    pub access_max_age_secs: u64,
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            prefix: default_cookie_prefix(),
            poll_interval_ms: default_poll_interval_ms(),
            refresh_max_age_secs: default_refresh_max_age_secs(),
            access_max_age_secs: default_access_max_age_secs(),
        }
    }
}

impl CookieSettings {
    pub fn refresh_cookie_name(&self) -> String {
        format!("{}-refresh", self.prefix)
    }

    pub fn access_cookie_name(&self) -> String {
        format!("{}-access", self.prefix)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn refresh_max_age(&self) -> Duration {
        Duration::from_secs(self.refresh_max_age_secs)
    }

    pub fn access_max_age(&self) -> Duration {
        Duration::from_secs(self.access_max_age_secs)
    }
}

/// Where the handler pages of the application live
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerUrls {
    #[serde(default = "default_sign_in_url")]
    pub sign_in: String,
    #[serde(default = "default_after_sign_in_url")]
    pub after_sign_in: String,
    #[serde(default = "default_after_sign_in_url")]
    pub after_sign_up: String,
    #[serde(default = "default_after_sign_out_url")]
    pub after_sign_out: String,
    #[serde(default = "default_oauth_callback_url")]
    pub oauth_callback: String,
    #[serde(default = "default_email_verification_url")]
    pub email_verification: String,
    #[serde(default = "default_error_url")]
    pub error: String,
}

impl Default for HandlerUrls {
    fn default() -> Self {
        Self {
            sign_in: default_sign_in_url(),
            after_sign_in: default_after_sign_in_url(),
            after_sign_up: default_after_sign_in_url(),
            after_sign_out: default_after_sign_out_url(),
            oauth_callback: default_oauth_callback_url(),
            email_verification: default_email_verification_url(),
            error: default_error_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RequestSettings {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_cookie_prefix() -> String {
    "sitzung".to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_refresh_max_age_secs() -> u64 {
    60 * 60 * 24 * 365
}

fn default_access_max_age_secs() -> u64 {
    60 * 60 * 24
}

fn default_sign_in_url() -> String {
    "/handler/sign-in".to_string()
}

fn default_after_sign_in_url() -> String {
    "/".to_string()
}

fn default_after_sign_out_url() -> String {
    "/".to_string()
}

fn default_oauth_callback_url() -> String {
    "/handler/oauth-callback".to_string()
}

fn default_email_verification_url() -> String {
    "/handler/email-verification".to_string()
}

fn default_error_url() -> String {
    "/handler/error".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_timeout_secs() -> u64 {
    30
}

/// Load the client configuration
///
/// Reads the TOML (or any format the `config` crate recognises) file at
/// `path`, then applies `SITZUNG__`-prefixed environment overrides, e.g.
/// `SITZUNG__COOKIES__POLL_INTERVAL_MS=250`.
pub fn load_config(path: &str) -> Result<ClientConfig> {
    let config: ClientConfig = Config::builder()
        .add_source(File::with_name(path))
        .add_source(Environment::with_prefix("SITZUNG").separator("__"))
        .build()?
        .try_deserialize()?;

    if config.project_id.trim().is_empty() {
        return Err(AuthError::Configuration("project_id must not be empty".into()));
    }
    Ok(config)
}
