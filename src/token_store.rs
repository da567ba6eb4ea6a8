/// Token pairs and the token store backends
use crate::config::CookieSettings;
use crate::cookie::{parse_cookie_header, CookieJar};
use crate::error::{AuthError, Result};
use crate::store::{Store, WeakStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Header carrying `{"accessToken": ..., "refreshToken": ...}` for clients
/// that cannot rely on same-origin cookies
pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// Access and refresh token of one user
///
/// A non-null access token always belongs to the refresh token next to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenPair {
    pub fn new(access_token: Option<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token,
            refresh_token,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }

    /// Replace the refresh token, dropping the access token if it no longer pairs
    pub fn with_refresh_token(&self, refresh_token: Option<String>) -> Self {
        let access_token = if refresh_token == self.refresh_token {
            self.access_token.clone()
        } else {
            None
        };
        Self {
            access_token,
            refresh_token,
        }
    }
}

/// Observable token pair bound to a persistence medium
pub type TokenStore = Store<TokenPair>;

/// Anything that exposes request headers, e.g. an incoming HTTP request
/// handled during server rendering
pub trait RequestLike: Send + Sync {
    /// Case-insensitive header lookup
    fn header(&self, name: &str) -> Option<String>;
}

/// Plain header map implementing [`RequestLike`]
#[derive(Debug, Default, Clone)]
pub struct RequestHeaders {
    headers: HashMap<String, String>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }
}

impl RequestLike for RequestHeaders {
    fn header(&self, name: &str) -> Option<String> {
        self.headers.get(&name.to_ascii_lowercase()).cloned()
    }
}

/// How a token store should be created
#[derive(Clone)]
pub enum TokenStoreInit {
    /// One in-memory cell per resolver
    Memory,
    /// Browser-like cookies, synchronized across tabs
    Cookie,
    /// Immutable snapshot derived from a request's headers
    Request(Arc<dyn RequestLike>),
    /// Explicit tokens, not persisted anywhere
    Tokens(TokenPair),
}

impl fmt::Debug for TokenStoreInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "Memory"),
            Self::Cookie => write!(f, "Cookie"),
            Self::Request(_) => write!(f, "Request(..)"),
            Self::Tokens(_) => write!(f, "Tokens(..)"),
        }
    }
}

/// Read the token pair out of the refresh and access cookie values
///
/// The access cookie holds `[refreshToken, accessToken]`; it is only trusted
/// when its refresh token equals the refresh cookie.
pub fn tokens_from_cookies(refresh_cookie: Option<String>, access_cookie: Option<&str>) -> TokenPair {
    let access_token = access_cookie
        .filter(|value| value.starts_with("[\""))
        .and_then(|value| serde_json::from_str::<(String, String)>(value).ok())
        .filter(|(paired_refresh, _)| Some(paired_refresh) == refresh_cookie.as_ref())
        .map(|(_, access)| access);

    TokenPair {
        access_token,
        refresh_token: refresh_cookie,
    }
}

fn read_cookie_tokens(
    jar: &dyn CookieJar,
    settings: &CookieSettings,
    previous: Option<&TokenPair>,
) -> Result<TokenPair> {
    let refresh_cookie = jar.get(&settings.refresh_cookie_name())?;
    let access_cookie = jar.get(&settings.access_cookie_name())?;
    let tokens = tokens_from_cookies(refresh_cookie, access_cookie.as_deref());

    // Keep an access token we only have in memory as long as it still pairs
    let access_token = tokens.access_token.or_else(|| {
        previous
            .filter(|previous| previous.refresh_token == tokens.refresh_token)
            .and_then(|previous| previous.access_token.clone())
    });

    Ok(TokenPair {
        access_token,
        refresh_token: tokens.refresh_token,
    })
}

fn write_cookie_tokens(jar: &dyn CookieJar, settings: &CookieSettings, tokens: &TokenPair) -> Result<()> {
    jar.set_or_delete(
        &settings.refresh_cookie_name(),
        tokens.refresh_token.as_deref(),
        Some(settings.refresh_max_age()),
    )?;

    let paired = match (&tokens.refresh_token, &tokens.access_token) {
        (Some(refresh), Some(access)) => Some(serde_json::to_string(&(refresh, access))?),
        _ => None,
    };
    jar.set_or_delete(
        &settings.access_cookie_name(),
        paired.as_deref(),
        Some(settings.access_max_age()),
    )
}

/// Resolves [`TokenStoreInit`] descriptors into token stores
///
/// Owns the per-client memory store, the cookie store and the per-request
/// snapshots. Dropping the resolver stops the cookie poll task.
pub struct TokenStoreResolver {
    settings: CookieSettings,
    cookie_jar: Option<Arc<dyn CookieJar>>,
    memory_store: TokenStore,
    cookie_store: Mutex<Option<TokenStore>>,
    request_stores: Mutex<Vec<(Weak<dyn RequestLike>, TokenStore)>>,
    shutdown: CancellationToken,
}

impl TokenStoreResolver {
    /// Create a resolver
    ///
    /// `cookie_jar` is the browser-like jar; without one, cookie stores cannot
    /// be created.
    pub fn new(settings: CookieSettings, cookie_jar: Option<Arc<dyn CookieJar>>) -> Self {
        Self {
            settings,
            cookie_jar,
            memory_store: Store::new(TokenPair::empty()),
            cookie_store: Mutex::new(None),
            request_stores: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn resolve(&self, init: &TokenStoreInit) -> Result<TokenStore> {
        match init {
            TokenStoreInit::Memory => Ok(self.memory_store.clone()),
            TokenStoreInit::Cookie => self.cookie_store(),
            TokenStoreInit::Request(request) => self.request_store(request),
            TokenStoreInit::Tokens(tokens) => Ok(Store::new(tokens.clone())),
        }
    }

    pub fn has_cookie_jar(&self) -> bool {
        self.cookie_jar.is_some()
    }

    pub fn cookie_jar(&self) -> Option<Arc<dyn CookieJar>> {
        self.cookie_jar.clone()
    }

    fn cookie_store(&self) -> Result<TokenStore> {
        let jar = self.cookie_jar.clone().ok_or_else(|| {
            AuthError::Configuration(
                "Cannot use the cookie token store without a browser-like cookie jar".into(),
            )
        })?;

        let mut slot = self.cookie_store.lock();
        if let Some(store) = slot.as_ref() {
            return Ok(store.clone());
        }

        let store = Store::new(read_cookie_tokens(jar.as_ref(), &self.settings, None)?);
        let write_succeeded = Arc::new(AtomicBool::new(true));

        // Lives as long as the store; never unsubscribed
        let _persist = {
            let jar = jar.clone();
            let settings = self.settings.clone();
            let write_succeeded = write_succeeded.clone();
            store.on_change(move |tokens, _| {
                match write_cookie_tokens(jar.as_ref(), &settings, tokens) {
                    Ok(()) => write_succeeded.store(true, Ordering::SeqCst),
                    Err(AuthError::CookieWriteUnavailable) => {
                        warn!("cookie writes are unavailable here; pausing cookie sync");
                        write_succeeded.store(false, Ordering::SeqCst);
                    }
                    Err(e) => error!(error = %e, "failed to persist tokens to cookies"),
                }
            })
        };

        self.spawn_cookie_poll(store.downgrade(), jar, write_succeeded);
        *slot = Some(store.clone());
        Ok(store)
    }

    fn spawn_cookie_poll(
        &self,
        store: WeakStore<TokenPair>,
        jar: Arc<dyn CookieJar>,
        write_succeeded: Arc<AtomicBool>,
    ) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime; token cookie changes from other tabs will not be picked up");
            return;
        };

        let settings = self.settings.clone();
        let shutdown = self.shutdown.clone();
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(settings.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(store) = store.upgrade() else {
                    break;
                };
                if !write_succeeded.load(Ordering::SeqCst) {
                    continue;
                }

                let old = store.get();
                match read_cookie_tokens(jar.as_ref(), &settings, Some(&old)) {
                    Ok(current) if current != old => {
                        debug!("token cookies changed outside this client");
                        // Only apply if nothing was written locally since the read
                        store.update(|now| if *now == old { current } else { now.clone() });
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "failed to poll token cookies"),
                }
            }
            debug!("token cookie poll stopped");
        });
    }

    fn request_store(&self, request: &Arc<dyn RequestLike>) -> Result<TokenStore> {
        let mut stores = self.request_stores.lock();
        stores.retain(|(request, _)| request.strong_count() > 0);

        let key = Arc::downgrade(request);
        if let Some((_, store)) = stores.iter().find(|(known, _)| known.ptr_eq(&key)) {
            return Ok(store.clone());
        }

        let store = Store::frozen(self.tokens_from_request(request.as_ref())?);
        stores.push((key, store.clone()));
        Ok(store)
    }

    fn tokens_from_request(&self, request: &dyn RequestLike) -> Result<TokenPair> {
        if let Some(header) = request.header(AUTH_TOKEN_HEADER) {
            return parse_auth_token_header(&header);
        }

        let cookies = parse_cookie_header(&request.header("cookie").unwrap_or_default());
        let refresh = cookies.get(&self.settings.refresh_cookie_name()).cloned();
        let access = cookies.get(&self.settings.access_cookie_name());
        Ok(tokens_from_cookies(refresh, access.map(String::as_str)))
    }
}

impl Drop for TokenStoreResolver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Parse the JSON carried by the [`AUTH_TOKEN_HEADER`]
pub fn parse_auth_token_header(header: &str) -> Result<TokenPair> {
    let invalid = |reason: &str| {
        AuthError::Configuration(format!(
            "Invalid {} header ({}): {}",
            AUTH_TOKEN_HEADER, reason, header
        ))
    };

    let value: serde_json::Value =
        serde_json::from_str(header).map_err(|e| invalid(&e.to_string()))?;
    if value.is_null() {
        return Err(invalid("must not be null"));
    }
    if !value.is_object() {
        return Err(invalid("must be a JSON object"));
    }
    serde_json::from_value(value).map_err(|e| invalid(&e.to_string()))
}
