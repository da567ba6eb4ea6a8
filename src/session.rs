/// Refreshable sessions and the registry that shares them per token store
use crate::config::RequestSettings;
use crate::error::{AuthError, Result};
use crate::server::AuthServer;
use crate::store::{Store, Subscription, WeakStore};
use crate::token_store::{TokenPair, TokenStore};
use futures::future::{BoxFuture, FutureExt, Shared};
use jsonwebtoken::{decode, DecodingKey, Validation};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Access tokens are refreshed this long before they expire when sending
/// authenticated requests
const MIN_ACCESS_TOKEN_VALIDITY: Duration = Duration::from_secs(5);

/// An access token with its locally decoded expiry
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    token: String,
    expires_at: Option<SystemTime>,
}

#[derive(Deserialize)]
struct Claims {
    #[serde(default)]
    exp: Option<u64>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token == "undefined" {
            return Err(AuthError::Configuration(
                "Access token is the string 'undefined'; it's unlikely this is the correct value"
                    .into(),
            ));
        }
        let expires_at = decode_expiry(&token);
        Ok(Self { token, expires_at })
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// Expiry from the unverified `exp` claim; `None` for opaque tokens
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    pub fn expires_in(&self) -> Duration {
        match self.expires_at {
            Some(expires_at) => expires_at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
            None => Duration::MAX,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_in().is_zero()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("fingerprint", &fingerprint(&self.token))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Read `exp` without verifying the token; the server does that
fn decode_expiry(token: &str) -> Option<SystemTime> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    data.claims
        .exp
        .map(|exp| UNIX_EPOCH + Duration::from_secs(exp))
}

/// Short, non-reversible identifier of a token
fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..16])
}

/// Identify the session a token pair belongs to
///
/// Two pairs with the same refresh token share a session, whatever their
/// access tokens.
pub fn session_key(tokens: &TokenPair) -> String {
    match (&tokens.refresh_token, &tokens.access_token) {
        (Some(refresh), _) => format!("refresh-{}", fingerprint(refresh)),
        (None, Some(access)) => format!("access-{}", fingerprint(access)),
        (None, None) => "not-logged-in".to_string(),
    }
}

/// A usable access token and the refresh token it was issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidTokens {
    pub access_token: AccessToken,
    pub refresh_token: Option<String>,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Option<AccessToken>>>>;

struct SessionInner {
    server: Arc<dyn AuthServer>,
    session_key: String,
    refresh_token: Option<String>,
    access_token: Store<Option<AccessToken>>,
    known_invalid: Store<bool>,
    refreshing: Mutex<Option<(u64, RefreshFuture)>>,
    next_refresh_id: AtomicU64,
}

/// One signed-in (or signed-out) session
///
/// Cheap to clone; clones share the same state. Equality and hashing are by
/// identity, so sessions can key caches.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Session {}

impl Hash for Session {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as *const () as usize).hash(state);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_key", &self.inner.session_key)
            .field("known_invalid", &self.is_known_to_be_invalid())
            .finish()
    }
}

impl Session {
    pub fn new(server: Arc<dyn AuthServer>, tokens: &TokenPair) -> Result<Self> {
        let access_token = tokens
            .access_token
            .as_ref()
            .map(|token| AccessToken::new(token.clone()))
            .transpose()?;
        let known_invalid = tokens.is_empty();

        Ok(Self {
            inner: Arc::new(SessionInner {
                server,
                session_key: session_key(tokens),
                refresh_token: tokens.refresh_token.clone(),
                access_token: Store::new(access_token),
                known_invalid: Store::new(known_invalid),
                refreshing: Mutex::new(None),
                next_refresh_id: AtomicU64::new(0),
            }),
        })
    }

    pub fn session_key(&self) -> &str {
        &self.inner.session_key
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.inner.refresh_token.as_deref()
    }

    /// Current tokens, possibly expired; empty once the session is invalid
    pub fn tokens(&self) -> TokenPair {
        if self.is_known_to_be_invalid() {
            return TokenPair::empty();
        }
        TokenPair {
            access_token: self
                .inner
                .access_token
                .get()
                .map(|token| token.as_str().to_string()),
            refresh_token: self.inner.refresh_token.clone(),
        }
    }

    pub fn is_known_to_be_invalid(&self) -> bool {
        self.inner.known_invalid.get()
    }

    /// Mark the session invalid; listeners fire only the first time
    pub fn invalidate(&self) {
        self.inner.access_token.set(None);
        self.inner.known_invalid.set(true);
    }

    pub fn on_invalidate(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.known_invalid.on_change(move |invalid, _| {
            if *invalid {
                callback();
            }
        })
    }

    pub fn on_access_token_change(
        &self,
        callback: impl Fn(Option<&AccessToken>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner
            .access_token
            .on_change(move |token, _| callback(token.as_ref()))
    }

    /// Drop `token` if it is still the current access token
    pub fn mark_access_token_expired(&self, token: &AccessToken) {
        self.inner.access_token.update(|current| {
            if current.as_ref() == Some(token) {
                None
            } else {
                current.clone()
            }
        });
    }

    /// Join an in-flight refresh or start one
    ///
    /// A rejected refresh token invalidates the session and still returns
    /// `Ok(())`; other failures are returned and leave the session valid.
    pub async fn refresh(&self) -> Result<()> {
        match self.refresh_future(true) {
            Some(refresh) => refresh.await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Always refresh, ignoring any in-flight refresh
    pub async fn fetch_new_tokens(&self) -> Result<Option<ValidTokens>> {
        let Some(refresh) = self.refresh_future(false) else {
            return Ok(None);
        };
        Ok(refresh.await?.map(|access_token| self.valid_tokens(access_token)))
    }

    /// Tokens that stay valid for at least `min_validity`, refreshing if needed
    ///
    /// `min_validity` must be below one minute.
    pub async fn get_or_fetch_likely_valid_tokens(
        &self,
        min_validity: Duration,
    ) -> Result<Option<ValidTokens>> {
        if min_validity >= Duration::from_secs(60) {
            return Err(AuthError::Configuration(
                "Required access token validity must be less than 60 seconds".into(),
            ));
        }

        let current = self
            .inner
            .access_token
            .get()
            .filter(|token| !token.is_expired());
        if let Some(token) = current {
            if token.expires_in() >= min_validity {
                return Ok(Some(self.valid_tokens(token)));
            }
        }

        let Some(refresh) = self.refresh_future(true) else {
            return Ok(None);
        };
        Ok(refresh.await?.map(|access_token| self.valid_tokens(access_token)))
    }

    /// Run an authenticated request, refreshing and retrying as needed
    ///
    /// A rejected access token is marked expired and the request retried
    /// immediately; network errors are retried with exponential back-off.
    pub async fn authorized<T, F, Fut>(&self, settings: &RequestSettings, mut request: F) -> Result<T>
    where
        F: FnMut(Option<AccessToken>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = settings.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let can_retry = attempt < max_attempts;

            let access_token = match self
                .get_or_fetch_likely_valid_tokens(MIN_ACCESS_TOKEN_VALIDITY)
                .await
            {
                Ok(tokens) => tokens.map(|tokens| tokens.access_token),
                Err(err) if err.is_transient() && can_retry => {
                    backoff(settings, attempt).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match request(access_token.clone()).await {
                Err(AuthError::InvalidAccessToken) if can_retry => {
                    let Some(token) = access_token else {
                        return Err(AuthError::InvalidAccessToken);
                    };
                    debug!(attempt, "access token rejected, refreshing");
                    self.mark_access_token_expired(&token);
                }
                Err(err) if err.is_transient() && can_retry => {
                    debug!(attempt, error = %err, "request failed, retrying");
                    backoff(settings, attempt).await;
                }
                result => return result,
            }
        }
    }

    fn valid_tokens(&self, access_token: AccessToken) -> ValidTokens {
        ValidTokens {
            access_token,
            refresh_token: self.inner.refresh_token.clone(),
        }
    }

    fn refresh_future(&self, join_existing: bool) -> Option<RefreshFuture> {
        let refresh_token = self.inner.refresh_token.clone()?;
        if self.is_known_to_be_invalid() {
            return None;
        }

        let mut refreshing = self.inner.refreshing.lock();
        if join_existing {
            if let Some((_, refresh)) = refreshing.as_ref() {
                return Some(refresh.clone());
            }
        }

        let id = self.inner.next_refresh_id.fetch_add(1, Ordering::Relaxed);
        let server = Arc::clone(&self.inner.server);
        let weak = Arc::downgrade(&self.inner);
        let refresh = async move {
            debug!("refreshing access token");
            let result = match server.refresh(&refresh_token).await {
                Ok(token) => AccessToken::new(token).map(Some),
                Err(AuthError::RefreshTokenInvalid) => Ok(None),
                Err(err) => Err(err),
            };
            if let Some(inner) = weak.upgrade() {
                Session { inner }.finish_refresh(id, &result);
            }
            result
        }
        .boxed()
        .shared();

        *refreshing = Some((id, refresh.clone()));
        Some(refresh)
    }

    fn finish_refresh(&self, id: u64, result: &Result<Option<AccessToken>>) {
        {
            let mut refreshing = self.inner.refreshing.lock();
            match refreshing.as_ref() {
                Some((latest, _)) if *latest == id => *refreshing = None,
                // A newer refresh has started and decides the outcome
                _ => return,
            }
        }

        match result {
            Ok(Some(token)) => self.inner.access_token.set(Some(token.clone())),
            Ok(None) => {
                warn!(session = %self.inner.session_key, "refresh token rejected, invalidating session");
                self.invalidate();
            }
            Err(err) => debug!(error = %err, "refresh failed, session left as is"),
        }
    }
}

async fn backoff(settings: &RequestSettings, attempt: u32) {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    tokio::time::sleep(settings.retry_base_delay().saturating_mul(factor)).await;
}

struct StoreSessions {
    store: WeakStore<TokenPair>,
    sessions: HashMap<String, Session>,
}

/// Hands out one [`Session`] per (token store, session key)
///
/// Sessions live as long as their token store; entries of dropped stores are
/// pruned on the next lookup.
pub struct SessionRegistry {
    server: Arc<dyn AuthServer>,
    stores: Mutex<Vec<StoreSessions>>,
}

impl SessionRegistry {
    pub fn new(server: Arc<dyn AuthServer>) -> Self {
        Self {
            server,
            stores: Mutex::new(Vec::new()),
        }
    }

    /// Session for the tokens currently held by `store`
    pub fn session_for(&self, store: &TokenStore) -> Result<Session> {
        let tokens = store.get();
        let key = session_key(&tokens);

        let mut stores = self.stores.lock();
        stores.retain(|entry| entry.store.is_alive());

        let index = match stores.iter().position(|entry| {
            entry
                .store
                .upgrade()
                .is_some_and(|known| known.ptr_eq(store))
        }) {
            Some(index) => index,
            None => {
                stores.push(StoreSessions {
                    store: store.downgrade(),
                    sessions: HashMap::new(),
                });
                stores.len() - 1
            }
        };

        if let Some(session) = stores[index].sessions.get(&key) {
            return Ok(session.clone());
        }

        let session = Session::new(Arc::clone(&self.server), &tokens)?;
        wire_into_store(&session, store);
        debug!(session = %key, "created session");
        stores[index].sessions.insert(key, session.clone());
        Ok(session)
    }

    /// Sessions whose token store is still alive
    pub fn live_sessions(&self) -> HashSet<Session> {
        let mut stores = self.stores.lock();
        stores.retain(|entry| entry.store.is_alive());
        stores
            .iter()
            .flat_map(|entry| entry.sessions.values().cloned())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn tracked_stores(&self) -> usize {
        let mut stores = self.stores.lock();
        stores.retain(|entry| entry.store.is_alive());
        stores.len()
    }
}

/// Write session changes back into the token store while it still holds the
/// session's tokens
fn wire_into_store(session: &Session, store: &TokenStore) {
    let refresh_token = session.inner.refresh_token.clone();
    let key = session.inner.session_key.clone();

    let weak = store.downgrade();
    let _access = session.on_access_token_change(move |token| {
        let Some(store) = weak.upgrade() else {
            return;
        };
        store.update(|current| {
            if current.refresh_token != refresh_token {
                return current.clone();
            }
            TokenPair {
                access_token: token.map(|token| token.as_str().to_string()),
                refresh_token: current.refresh_token.clone(),
            }
        });
    });

    let weak = store.downgrade();
    let _invalidate = session.on_invalidate(move || {
        let Some(store) = weak.upgrade() else {
            return;
        };
        store.update(|current| {
            if session_key(current) == key {
                TokenPair::empty()
            } else {
                current.clone()
            }
        });
    });
}
