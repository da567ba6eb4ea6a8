/// OAuth authorization code flow with PKCE, driven through cookies and the
/// current location
use crate::cookie::CookieJar;
use crate::error::{AuthError, Result};
use crate::pkce::{generate_state, Pkce};
use crate::server::{AuthServer, OAuthUrlRequest, SignInTokens};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub const CODE_VERIFIER_COOKIE: &str = "oauth-code-verifier";
pub const STATE_COOKIE: &str = "oauth-state";

const FLOW_COOKIE_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Query parameters consumed by a claimed callback
const CALLBACK_PARAMS: [&str; 4] = ["code", "state", "error", "error_description"];

/// The address the client is currently showing
pub trait Location: Send + Sync {
    fn href(&self) -> String;

    /// Replace the current address without adding a history entry
    fn replace(&self, url: &str);
}

/// Sends the user somewhere else
///
/// On platforms where navigation unloads the client, `assign` never
/// returns control in a meaningful way; callers must not rely on work
/// scheduled after it.
pub trait Navigator: Send + Sync {
    fn assign(&self, url: &str) -> Result<()>;
}

/// Opens URLs in the user's default browser
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl Navigator for SystemBrowser {
    fn assign(&self, url: &str) -> Result<()> {
        info!(%url, "opening browser");
        webbrowser::open(url)?;
        Ok(())
    }
}

/// In-memory [`Location`] and [`Navigator`]
///
/// Useful for headless clients (fed from a loopback callback) and tests.
#[derive(Debug, Default)]
pub struct MemoryLocation {
    href: Mutex<String>,
    history: Mutex<Vec<String>>,
}

impl MemoryLocation {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: Mutex::new(href.into()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Every address assigned or replaced so far, oldest first
    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    fn navigate(&self, url: &str) {
        *self.href.lock() = url.to_string();
        self.history.lock().push(url.to_string());
    }
}

impl Location for MemoryLocation {
    fn href(&self) -> String {
        self.href.lock().clone()
    }

    fn replace(&self, url: &str) {
        self.navigate(url);
    }
}

impl Navigator for MemoryLocation {
    fn assign(&self, url: &str) -> Result<()> {
        self.navigate(url);
        Ok(())
    }
}

/// Resolve `target` against the current location
pub fn absolute_url(location: &dyn Location, target: &str) -> Result<String> {
    let href = location.href();
    let base = Url::parse(&href)
        .map_err(|e| AuthError::Configuration(format!("Invalid current location {}: {}", href, e)))?;
    let url = base
        .join(target)
        .map_err(|e| AuthError::Configuration(format!("Invalid URL {}: {}", target, e)))?;
    Ok(url.into())
}

/// A callback that belonged to this client and has been consumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackClaim {
    Code { code: String, code_verifier: String },
    ProviderError {
        error: String,
        description: Option<String>,
    },
}

/// Authorization code flow state machine
pub struct OAuthFlow {
    cookies: Arc<dyn CookieJar>,
    location: Arc<dyn Location>,
    claim_lock: Mutex<()>,
}

impl OAuthFlow {
    pub fn new(cookies: Arc<dyn CookieJar>, location: Arc<dyn Location>) -> Self {
        Self {
            cookies,
            location,
            claim_lock: Mutex::new(()),
        }
    }

    /// Store a fresh verifier and state, then send the user to the provider
    ///
    /// Returns the authorization URL that was assigned.
    pub async fn initiate(
        &self,
        server: &dyn AuthServer,
        navigator: &dyn Navigator,
        provider: &str,
        redirect_url: &str,
        error_redirect_url: &str,
        provider_scope: Option<String>,
    ) -> Result<String> {
        let pkce = Pkce::generate();
        let state = generate_state();

        self.cookies
            .set(CODE_VERIFIER_COOKIE, pkce.code_verifier(), Some(FLOW_COOKIE_MAX_AGE))?;
        self.cookies
            .set(STATE_COOKIE, &state, Some(FLOW_COOKIE_MAX_AGE))?;

        let url = server
            .get_oauth_url(&OAuthUrlRequest {
                provider: provider.to_string(),
                redirect_url: redirect_url.to_string(),
                error_redirect_url: error_redirect_url.to_string(),
                code_challenge: pkce.code_challenge().to_string(),
                state,
                provider_scope,
            })
            .await?;

        info!(provider, "redirecting to OAuth provider");
        navigator.assign(&url)?;
        Ok(url)
    }

    /// Consume the OAuth parameters of the current location if they belong
    /// to the flow this client started
    ///
    /// Runs to completion without yielding: once it returns `Some`, the
    /// cookies are gone and the location no longer carries the parameters,
    /// so a second caller sees `None`. A location whose flow cookies were
    /// already consumed is not a callback either.
    pub fn claim(&self) -> Result<Option<CallbackClaim>> {
        let _guard = self.claim_lock.lock();

        let href = self.location.href();
        let Ok(url) = Url::parse(&href) else {
            return Ok(None);
        };
        let param = |name: &str| {
            url.query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
        };

        let Some(state) = param("state") else {
            return Ok(None);
        };
        let code = param("code");
        let error = param("error");
        if code.is_none() && error.is_none() {
            return Ok(None);
        }

        let expected_state = self.cookies.get(STATE_COOKIE)?;
        let code_verifier = self.cookies.get(CODE_VERIFIER_COOKIE)?;
        let (Some(expected_state), Some(code_verifier)) = (expected_state, code_verifier) else {
            // Already claimed elsewhere, e.g. the same callback open in another tab
            warn!("OAuth callback parameters present but no flow cookies; ignoring them");
            return Ok(None);
        };

        if state != expected_state {
            // Probably another tab started a newer flow
            warn!("OAuth callback state does not match this client's flow; ignoring it");
            return Ok(None);
        }

        self.cookies.delete(CODE_VERIFIER_COOKIE)?;
        self.cookies.delete(STATE_COOKIE)?;
        self.location.replace(&strip_callback_params(&url));
        debug!("claimed OAuth callback");

        let claim = match (code, error) {
            (_, Some(error)) => CallbackClaim::ProviderError {
                error,
                description: param("error_description"),
            },
            (Some(code), None) => CallbackClaim::Code {
                code,
                code_verifier,
            },
            (None, None) => return Ok(None),
        };
        Ok(Some(claim))
    }

    /// Claim the callback and exchange its code for tokens
    ///
    /// `Ok(None)` when the location holds no callback for this client.
    pub async fn call_oauth_callback(
        &self,
        server: &dyn AuthServer,
        redirect_url: &str,
    ) -> Result<Option<SignInTokens>> {
        let Some(claim) = self.claim()? else {
            return Ok(None);
        };

        match claim {
            CallbackClaim::ProviderError { error, description } => {
                Err(AuthError::OAuthErrorResponse { error, description })
            }
            CallbackClaim::Code {
                code,
                code_verifier,
            } => match server.exchange_code(&code, &code_verifier, redirect_url).await {
                Ok(tokens) => Ok(Some(tokens)),
                Err(AuthError::Known(known)) => Err(AuthError::Known(known)),
                Err(err) => Err(AuthError::CallbackExchange(Box::new(err))),
            },
        }
    }
}

fn strip_callback_params(url: &Url) -> String {
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .into_owned()
        .filter(|(key, _)| !CALLBACK_PARAMS.contains(&key.as_str()))
        .collect();

    let mut stripped = url.clone();
    if remaining.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.query_pairs_mut().clear().extend_pairs(remaining);
    }
    stripped.into()
}
