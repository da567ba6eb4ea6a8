/// Client facade: token stores, sessions, caches and sign-in flows behind one
/// handle
use crate::cache::{AsyncCache, CacheMode};
use crate::config::{ClientConfig, HandlerUrls};
use crate::cookie::CookieJar;
use crate::error::{AuthError, Outcome, Result};
use crate::models::{CurrentUser, Project, Team, TeamPermission};
use crate::oauth::{absolute_url, Location, Navigator, OAuthFlow};
use crate::server::{AuthServer, SignInTokens};
use crate::session::{Session, SessionRegistry};
use crate::store::{Observable, Subscription};
use crate::token_store::{TokenPair, TokenStore, TokenStoreInit, TokenStoreResolver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// What [`ClientApp::get_user`] does when nobody is signed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GetUserOr {
    #[default]
    ReturnNull,
    Redirect,
    Throw,
}

#[derive(Debug, Clone, Default)]
pub struct GetUserOptions {
    pub or: GetUserOr,
    /// Overrides the client's default token store
    pub token_store: Option<TokenStoreInit>,
}

/// Handler pages a client can send the user to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    SignIn,
    AfterSignIn,
    AfterSignUp,
    AfterSignOut,
    OAuthCallback,
    EmailVerification,
    Error,
}

impl Handler {
    pub fn url(self, urls: &HandlerUrls) -> &str {
        match self {
            Self::SignIn => &urls.sign_in,
            Self::AfterSignIn => &urls.after_sign_in,
            Self::AfterSignUp => &urls.after_sign_up,
            Self::AfterSignOut => &urls.after_sign_out,
            Self::OAuthCallback => &urls.oauth_callback,
            Self::EmailVerification => &urls.email_verification,
            Self::Error => &urls.error,
        }
    }
}

/// Live clients by unique identifier
///
/// Building a client with an identifier that is already registered returns
/// the existing client when the options match and fails otherwise.
#[derive(Default)]
pub struct AppRegistry {
    apps: Mutex<HashMap<String, (String, Weak<AppInner>)>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, unique_identifier: &str) -> Option<ClientApp> {
        self.apps
            .lock()
            .get(unique_identifier)
            .and_then(|(_, app)| app.upgrade())
            .map(|inner| ClientApp { inner })
    }

    pub fn len(&self) -> usize {
        let mut apps = self.apps.lock();
        apps.retain(|_, (_, app)| app.strong_count() > 0);
        apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caches keyed by something that belongs to a session
trait SessionScoped {
    fn session(&self) -> &Session;
}

impl SessionScoped for Session {
    fn session(&self) -> &Session {
        self
    }
}

impl SessionScoped for (Session, String, bool) {
    fn session(&self) -> &Session {
        &self.0
    }
}

/// Cache whose entries refresh when their session is invalidated
fn session_cache<D, T, F, Fut>(fetcher: F) -> AsyncCache<D, T>
where
    D: SessionScoped + std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    F: Fn(D) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    AsyncCache::with_on_subscribe(fetcher, |deps: &D, refresh| {
        deps.session().on_invalidate(move || refresh())
    })
}

struct AppInner {
    config: ClientConfig,
    server: Arc<dyn AuthServer>,
    resolver: TokenStoreResolver,
    sessions: SessionRegistry,
    default_token_store: Option<TokenStoreInit>,
    location: Option<Arc<dyn Location>>,
    navigator: Option<Arc<dyn Navigator>>,
    oauth: Option<OAuthFlow>,
    user_cache: AsyncCache<Session, Option<CurrentUser>>,
    teams_cache: AsyncCache<Session, Vec<Team>>,
    permissions_cache: AsyncCache<(Session, String, bool), Vec<TeamPermission>>,
    project_cache: AsyncCache<(), Project>,
}

/// Handle to one configured client; clones share everything
#[derive(Clone)]
pub struct ClientApp {
    inner: Arc<AppInner>,
}

impl fmt::Debug for ClientApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientApp")
            .field("project_id", &self.inner.config.project_id)
            .field("default_token_store", &self.inner.default_token_store)
            .finish()
    }
}

pub struct ClientAppBuilder {
    config: ClientConfig,
    server: Arc<dyn AuthServer>,
    cookie_jar: Option<Arc<dyn CookieJar>>,
    location: Option<Arc<dyn Location>>,
    navigator: Option<Arc<dyn Navigator>>,
    token_store: Option<TokenStoreInit>,
    registry: Option<(Arc<AppRegistry>, String)>,
}

impl ClientAppBuilder {
    /// Browser-like cookie jar for the cookie token store and the OAuth flow
    pub fn cookie_jar(mut self, cookie_jar: Arc<dyn CookieJar>) -> Self {
        self.cookie_jar = Some(cookie_jar);
        self
    }

    pub fn location(mut self, location: Arc<dyn Location>) -> Self {
        self.location = Some(location);
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    /// Default token store of every call that does not name one
    pub fn token_store(mut self, init: TokenStoreInit) -> Self {
        self.token_store = Some(init);
        self
    }

    pub fn unique_identifier(mut self, registry: Arc<AppRegistry>, id: impl Into<String>) -> Self {
        self.registry = Some((registry, id.into()));
        self
    }

    pub fn build(self) -> Result<ClientApp> {
        let check = format!("{:?}|{:?}", self.config, self.token_store);

        let Some((registry, id)) = self.registry.clone() else {
            return self.build_app();
        };

        let mut apps = registry.apps.lock();
        if let Some((existing_check, existing)) = apps.get(&id) {
            if let Some(inner) = existing.upgrade() {
                if *existing_check != check {
                    return Err(AuthError::Configuration(format!(
                        "A client with unique identifier {} already exists with different options",
                        id
                    )));
                }
                debug!(%id, "reusing registered client");
                return Ok(ClientApp { inner });
            }
        }

        let app = self.build_app()?;
        apps.insert(id, (check, Arc::downgrade(&app.inner)));
        Ok(app)
    }

    fn build_app(self) -> Result<ClientApp> {
        let resolver = TokenStoreResolver::new(self.config.cookies.clone(), self.cookie_jar.clone());
        if let Some(init @ TokenStoreInit::Cookie) = &self.token_store {
            // Fail early and start cookie synchronization
            resolver.resolve(init)?;
        }

        let oauth = match (&self.cookie_jar, &self.location) {
            (Some(jar), Some(location)) => Some(OAuthFlow::new(Arc::clone(jar), Arc::clone(location))),
            _ => None,
        };

        let settings = self.config.requests.clone();
        let server = Arc::clone(&self.server);
        let user_cache = session_cache(move |session: Session| {
            let server = Arc::clone(&server);
            let settings = settings.clone();
            async move {
                if session.is_known_to_be_invalid() {
                    return Ok(None);
                }
                debug!(session = %session.session_key(), "fetching current user");
                let user = session
                    .authorized(&settings, |token| {
                        let server = Arc::clone(&server);
                        async move {
                            match token {
                                Some(token) => server.get_current_user(token.as_str()).await,
                                None => Ok(None),
                            }
                        }
                    })
                    .await?;
                user.map(CurrentUser::try_from).transpose()
            }
        });

        let settings = self.config.requests.clone();
        let server = Arc::clone(&self.server);
        let teams_cache = session_cache(move |session: Session| {
            let server = Arc::clone(&server);
            let settings = settings.clone();
            async move {
                let teams = session
                    .authorized(&settings, |token| {
                        let server = Arc::clone(&server);
                        async move {
                            let token = token.ok_or(AuthError::NotSignedIn)?;
                            server.list_teams(token.as_str()).await
                        }
                    })
                    .await?;
                teams.into_iter().map(Team::try_from).collect()
            }
        });

        let settings = self.config.requests.clone();
        let server = Arc::clone(&self.server);
        let permissions_cache = session_cache(move |(session, team_id, recursive): (Session, String, bool)| {
            let server = Arc::clone(&server);
            let settings = settings.clone();
            async move {
                let permissions = session
                    .authorized(&settings, |token| {
                        let server = Arc::clone(&server);
                        let team_id = team_id.clone();
                        async move {
                            let token = token.ok_or(AuthError::NotSignedIn)?;
                            server
                                .list_team_permissions(token.as_str(), &team_id, recursive)
                                .await
                        }
                    })
                    .await?;
                Ok(permissions.into_iter().map(TeamPermission::from).collect())
            }
        });

        let server = Arc::clone(&self.server);
        let project_cache = AsyncCache::new(move |()| {
            let server = Arc::clone(&server);
            async move { Project::try_from(server.get_project().await?) }
        });

        Ok(ClientApp {
            inner: Arc::new(AppInner {
                sessions: SessionRegistry::new(Arc::clone(&self.server)),
                config: self.config,
                server: self.server,
                resolver,
                default_token_store: self.token_store,
                location: self.location,
                navigator: self.navigator,
                oauth,
                user_cache,
                teams_cache,
                permissions_cache,
                project_cache,
            }),
        })
    }
}

impl ClientApp {
    pub fn builder(config: ClientConfig, server: Arc<dyn AuthServer>) -> ClientAppBuilder {
        ClientAppBuilder {
            config,
            server,
            cookie_jar: None,
            location: None,
            navigator: None,
            token_store: None,
            registry: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Token store for `init`, falling back to the client's default
    pub fn token_store(&self, init: Option<&TokenStoreInit>) -> Result<TokenStore> {
        let init = init
            .or(self.inner.default_token_store.as_ref())
            .ok_or_else(|| {
                AuthError::Configuration(
                    "Cannot call this function on a client without a persistent token store. \
                     Set a default token store or pass one explicitly."
                        .into(),
                )
            })?;
        self.inner.resolver.resolve(init)
    }

    pub fn get_session(&self, init: Option<&TokenStoreInit>) -> Result<Session> {
        let store = self.token_store(init)?;
        let session = self.inner.sessions.session_for(&store)?;
        self.evict_dropped_sessions();
        Ok(session)
    }

    /// Default token store, if sign-ins written to it are kept
    fn persistent_token_store(&self) -> Result<TokenStore> {
        if let Some(TokenStoreInit::Tokens(_)) = &self.inner.default_token_store {
            return Err(AuthError::Configuration(
                "Cannot sign in with a default token store of explicit tokens; \
                 use a memory or cookie token store"
                    .into(),
            ));
        }
        let store = self.token_store(None)?;
        if store.is_frozen() {
            return Err(AuthError::Configuration(
                "Cannot sign in with a request token store; its tokens are read-only".into(),
            ));
        }
        Ok(store)
    }

    /// Drop cached data of sessions whose token store is gone
    fn evict_dropped_sessions(&self) {
        let live = self.inner.sessions.live_sessions();
        let evicted = self.inner.user_cache.evict_where(|session| !live.contains(session))
            + self.inner.teams_cache.evict_where(|session| !live.contains(session))
            + self
                .inner
                .permissions_cache
                .evict_where(|deps| !live.contains(deps.session()));
        if evicted > 0 {
            debug!(evicted, "evicted cache entries of dropped sessions");
        }
    }

    pub async fn get_user(&self, options: GetUserOptions) -> Result<Option<CurrentUser>> {
        let session = self.get_session(options.token_store.as_ref())?;
        let user = self
            .inner
            .user_cache
            .get_or_wait(&session, CacheMode::ReadWrite)
            .await?;

        match (user, options.or) {
            (Some(user), _) => Ok(Some(user)),
            (None, GetUserOr::ReturnNull) => Ok(None),
            (None, GetUserOr::Redirect) => {
                self.redirect_to(Handler::SignIn)?;
                Ok(None)
            }
            (None, GetUserOr::Throw) => Err(AuthError::NotSignedIn),
        }
    }

    /// Observe the signed-in user
    ///
    /// Snapshots are `None` while the user is loading and `Some(None)` when
    /// nobody is signed in.
    pub fn use_user(&self, token_store: Option<&TokenStoreInit>) -> Result<UserWatch> {
        let store = self.token_store(token_store)?;
        Ok(SessionWatch::new(self.clone(), store, self.inner.user_cache.clone()))
    }

    pub async fn list_teams(&self, token_store: Option<&TokenStoreInit>) -> Result<Vec<Team>> {
        let session = self.get_session(token_store)?;
        self.inner
            .teams_cache
            .get_or_wait(&session, CacheMode::ReadWrite)
            .await
    }

    pub fn use_teams(&self, token_store: Option<&TokenStoreInit>) -> Result<TeamsWatch> {
        let store = self.token_store(token_store)?;
        Ok(SessionWatch::new(self.clone(), store, self.inner.teams_cache.clone()))
    }

    pub async fn list_team_permissions(
        &self,
        team_id: &str,
        recursive: bool,
        token_store: Option<&TokenStoreInit>,
    ) -> Result<Vec<TeamPermission>> {
        let session = self.get_session(token_store)?;
        self.inner
            .permissions_cache
            .get_or_wait(&(session, team_id.to_string(), recursive), CacheMode::ReadWrite)
            .await
    }

    /// Project settings visible to clients, fetched once
    pub async fn get_project(&self) -> Result<Project> {
        self.inner
            .project_cache
            .get_or_wait(&(), CacheMode::ReadWrite)
            .await
    }

    fn oauth_flow(&self) -> Result<&OAuthFlow> {
        self.inner.oauth.as_ref().ok_or_else(|| {
            AuthError::Configuration(
                "OAuth sign-in needs a cookie jar and a location".into(),
            )
        })
    }

    fn navigator(&self) -> Result<&Arc<dyn Navigator>> {
        self.inner.navigator.as_ref().ok_or_else(|| {
            AuthError::Configuration("Cannot redirect without a navigator".into())
        })
    }

    fn handler_url(&self, handler: Handler) -> Result<String> {
        let target = handler.url(&self.inner.config.urls);
        match &self.inner.location {
            Some(location) => absolute_url(location.as_ref(), target),
            None => Ok(target.to_string()),
        }
    }

    /// Send the user to a handler page
    pub fn redirect_to(&self, handler: Handler) -> Result<()> {
        let url = self.handler_url(handler)?;
        debug!(?handler, %url, "redirecting");
        self.navigator()?.assign(&url)
    }

    /// Start the OAuth flow for `provider`
    ///
    /// Control returns after the navigator was asked to open the provider;
    /// where that unloads the client, nothing after this call runs.
    pub async fn sign_in_with_oauth(&self, provider: &str) -> Result<()> {
        self.persistent_token_store()?;
        let flow = self.oauth_flow()?;
        let navigator = self.navigator()?;
        let redirect_url = self.handler_url(Handler::OAuthCallback)?;
        let error_url = self.handler_url(Handler::Error)?;

        flow.initiate(
            self.inner.server.as_ref(),
            navigator.as_ref(),
            provider,
            &redirect_url,
            &error_url,
            self.inner.config.provider_scope(provider),
        )
        .await?;
        Ok(())
    }

    /// Finish an OAuth sign-in if the current location is its callback
    ///
    /// Returns `false` when there was nothing to claim.
    pub async fn call_oauth_callback(&self) -> Result<bool> {
        self.persistent_token_store()?;
        let flow = self.oauth_flow()?;
        let redirect_url = self.handler_url(Handler::OAuthCallback)?;

        let Some(tokens) = flow
            .call_oauth_callback(self.inner.server.as_ref(), &redirect_url)
            .await?
        else {
            warn!("no OAuth callback to handle at the current location");
            return Ok(false);
        };

        self.sign_in_to_account_with_tokens(&tokens.to_pair())?;
        self.redirect_after_sign_in(&tokens, false)?;
        Ok(true)
    }

    pub async fn sign_in_with_credential(
        &self,
        email: &str,
        password: &str,
        no_redirect: bool,
    ) -> Result<Outcome<()>> {
        self.persistent_token_store()?;
        let outcome = self
            .inner
            .server
            .sign_in_with_credential(email, password)
            .await?;
        self.finish_sign_in(outcome, no_redirect)
    }

    pub async fn sign_up_with_credential(
        &self,
        email: &str,
        password: &str,
        no_redirect: bool,
    ) -> Result<Outcome<()>> {
        self.persistent_token_store()?;
        let verification_url = self.handler_url(Handler::EmailVerification)?;
        let outcome = self
            .inner
            .server
            .sign_up_with_credential(email, password, &verification_url)
            .await?;
        self.finish_sign_in(outcome, no_redirect)
    }

    pub async fn sign_in_with_magic_link(&self, code: &str, no_redirect: bool) -> Result<Outcome<()>> {
        self.persistent_token_store()?;
        let outcome = self.inner.server.sign_in_with_magic_link(code).await?;
        self.finish_sign_in(outcome, no_redirect)
    }

    fn finish_sign_in(&self, outcome: Outcome<SignInTokens>, no_redirect: bool) -> Result<Outcome<()>> {
        let tokens = match outcome {
            Ok(tokens) => tokens,
            Err(known) => {
                debug!(error = %known, "sign-in rejected");
                return Ok(Err(known));
            }
        };

        self.sign_in_to_account_with_tokens(&tokens.to_pair())?;
        self.redirect_after_sign_in(&tokens, no_redirect)?;
        Ok(Ok(()))
    }

    fn redirect_after_sign_in(&self, tokens: &SignInTokens, no_redirect: bool) -> Result<()> {
        if no_redirect {
            return Ok(());
        }
        if tokens.is_new_user {
            self.redirect_to(Handler::AfterSignUp)
        } else {
            self.redirect_to(Handler::AfterSignIn)
        }
    }

    /// Replace the tokens of the default token store
    ///
    /// Fails if that store would not keep them.
    pub fn sign_in_to_account_with_tokens(&self, tokens: &TokenPair) -> Result<()> {
        let store = self.persistent_token_store()?;
        store.set(tokens.clone());
        info!("signed in");
        Ok(())
    }

    /// Revoke the session, clear its tokens and go to the after-sign-out page
    pub async fn sign_out(&self, token_store: Option<&TokenStoreInit>) -> Result<()> {
        let session = self.get_session(token_store)?;
        let revoked = self.inner.server.sign_out(&session.tokens()).await;

        session.invalidate();
        self.inner.user_cache.evict_where(|deps| *deps == session);
        self.inner.teams_cache.evict_where(|deps| *deps == session);
        self.inner
            .permissions_cache
            .evict_where(|deps| deps.session() == &session);

        if let Err(err) = revoked {
            warn!(error = %err, "server sign-out failed; signed out locally");
            return Err(err);
        }
        info!("signed out");
        self.redirect_to(Handler::AfterSignOut)
    }
}

/// [`Observable`] over the cache entry of whatever session a token store
/// currently holds
///
/// Follows the token store: when it switches to another session, the watch
/// moves to that session's entry and notifies.
pub struct SessionWatch<T> {
    app: ClientApp,
    store: TokenStore,
    cache: AsyncCache<Session, T>,
}

pub type UserWatch = SessionWatch<Option<CurrentUser>>;
pub type TeamsWatch = SessionWatch<Vec<Team>>;

impl<T> SessionWatch<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(app: ClientApp, store: TokenStore, cache: AsyncCache<Session, T>) -> Self {
        Self { app, store, cache }
    }

    pub fn session(&self) -> Result<Session> {
        self.app.inner.sessions.session_for(&self.store)
    }
}

type Followed = Arc<Mutex<Option<(Session, Subscription)>>>;

impl<T> Observable for SessionWatch<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Snapshot = Option<T>;

    fn subscribe(&self, callback: Box<dyn Fn() + Send + Sync>) -> Subscription {
        let callback: Arc<dyn Fn() + Send + Sync> = Arc::from(callback);
        let followed: Followed = Arc::new(Mutex::new(None));

        // Subscribe to the entry of the store's current session; true if it changed
        let follow = {
            let app = self.app.clone();
            let store = self.store.clone();
            let cache = self.cache.clone();
            let followed = Arc::clone(&followed);
            let callback = Arc::clone(&callback);
            move || -> bool {
                let session = match app.inner.sessions.session_for(&store) {
                    Ok(session) => session,
                    Err(err) => {
                        warn!(error = %err, "cannot resolve session for watch");
                        return false;
                    }
                };
                if followed
                    .lock()
                    .as_ref()
                    .is_some_and(|(current, _)| *current == session)
                {
                    return false;
                }

                let notify = Arc::clone(&callback);
                let subscription = cache.on_state_change(&session, move |_| notify());
                let previous = followed.lock().replace((session, subscription));
                if let Some((_, previous)) = previous {
                    previous.unsubscribe();
                }
                true
            }
        };
        let follow = Arc::new(follow);

        follow();
        let on_store_change = {
            let follow = Arc::clone(&follow);
            let callback = Arc::clone(&callback);
            self.store.on_change(move |_, _| {
                if follow() {
                    callback();
                }
            })
        };

        Subscription::merge(vec![
            on_store_change,
            Subscription::new(move || {
                if let Some((_, subscription)) = followed.lock().take() {
                    subscription.unsubscribe();
                }
            }),
        ])
    }

    fn snapshot(&self) -> Option<T> {
        let session = self.session().ok()?;
        self.cache.get_if_cached(&session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::MemoryCookieJar;
    use crate::error::KnownError;
    use crate::oauth::MemoryLocation;
    use crate::server::testing::{tokens, MockAuthServer};
    use crate::models::TeamCrud;
    use crate::token_store::{RequestHeaders, RequestLike};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use url::Url;

    const ORIGIN: &str = "http://localhost:3000/";

    struct Fixture {
        app: ClientApp,
        server: Arc<MockAuthServer>,
        location: Arc<MemoryLocation>,
        jar: MemoryCookieJar,
    }

    fn fixture(token_store: Option<TokenStoreInit>) -> Fixture {
        let server = Arc::new(MockAuthServer::new());
        let location = Arc::new(MemoryLocation::new(ORIGIN));
        let jar = MemoryCookieJar::new();

        let mut builder = ClientApp::builder(ClientConfig::new("demo", "https://auth.example.com"), server.clone())
            .cookie_jar(Arc::new(jar.clone()))
            .location(location.clone())
            .navigator(location.clone());
        if let Some(init) = token_store {
            builder = builder.token_store(init);
        }

        Fixture {
            app: builder.build().unwrap(),
            server,
            location,
            jar,
        }
    }

    fn signed_in(access: &str, refresh: &str) -> TokenStoreInit {
        TokenStoreInit::Tokens(TokenPair::new(
            Some(access.to_string()),
            Some(refresh.to_string()),
        ))
    }

    #[tokio::test]
    async fn test_get_user_is_cached_per_session() {
        let f = fixture(Some(TokenStoreInit::Memory));
        f.server.add_user("a1", "u1");
        f.app
            .sign_in_to_account_with_tokens(&TokenPair::new(Some("a1".into()), Some("r1".into())))
            .unwrap();

        let first = f.app.get_user(GetUserOptions::default()).await.unwrap().unwrap();
        let second = f.app.get_user(GetUserOptions::default()).await.unwrap().unwrap();

        assert_eq!(first.id, "u1");
        assert_eq!(first, second);
        assert_eq!(f.server.user_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_signed_out_user_options() {
        let f = fixture(Some(TokenStoreInit::Memory));

        let none = f.app.get_user(GetUserOptions::default()).await.unwrap();
        assert_eq!(none, None);

        let thrown = f
            .app
            .get_user(GetUserOptions {
                or: GetUserOr::Throw,
                token_store: None,
            })
            .await;
        assert!(matches!(thrown, Err(AuthError::NotSignedIn)));

        f.app
            .get_user(GetUserOptions {
                or: GetUserOr::Redirect,
                token_store: None,
            })
            .await
            .unwrap();
        assert_eq!(f.location.href(), "http://localhost:3000/handler/sign-in");
    }

    #[tokio::test]
    async fn test_token_store_is_required() {
        let f = fixture(None);
        let result = f.app.get_user(GetUserOptions::default()).await;
        assert!(matches!(result, Err(AuthError::Configuration(_))));

        // An explicit store works
        f.server.add_user("a1", "u1");
        let user = f
            .app
            .get_user(GetUserOptions {
                or: GetUserOr::ReturnNull,
                token_store: Some(signed_in("a1", "r1")),
            })
            .await
            .unwrap();
        assert_eq!(user.map(|user| user.id), Some("u1".to_string()));
    }

    #[test]
    fn test_cookie_store_without_jar_fails_to_build() {
        let result = ClientApp::builder(
            ClientConfig::new("demo", "https://auth.example.com"),
            Arc::new(MockAuthServer::new()),
        )
        .token_store(TokenStoreInit::Cookie)
        .build();
        assert!(matches!(result, Err(AuthError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_oauth_sign_in_round_trip() {
        let f = fixture(Some(TokenStoreInit::Cookie));
        f.server.set_exchange_result(Ok(tokens("a1", "r1", true)));
        f.server.add_user("a1", "u1");

        f.app.sign_in_with_oauth("github").await.unwrap();
        let provider_url = Url::parse(&f.location.href()).unwrap();
        let state = provider_url
            .query_pairs()
            .find(|(key, _)| key == "state")
            .map(|(_, value)| value.into_owned())
            .unwrap();

        // The provider redirects back
        f.location
            .assign(&format!(
                "http://localhost:3000/handler/oauth-callback?code=xyz&state={}",
                state
            ))
            .unwrap();
        assert!(f.app.call_oauth_callback().await.unwrap());
        assert!(!f.app.call_oauth_callback().await.unwrap());

        // New users land on the after-sign-up page
        assert_eq!(f.location.href(), "http://localhost:3000/");
        assert_eq!(f.server.exchange_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.jar.get("sitzung-refresh").unwrap(), Some("r1".to_string()));

        let user = f.app.get_user(GetUserOptions::default()).await.unwrap();
        assert_eq!(user.map(|user| user.id), Some("u1".to_string()));
    }

    #[tokio::test]
    async fn test_revoked_refresh_token_signs_out() {
        let f = fixture(Some(TokenStoreInit::Memory));
        f.server.set_refresh_result(Err(AuthError::RefreshTokenInvalid));
        f.app
            .sign_in_to_account_with_tokens(&TokenPair::new(Some("stale".into()), Some("r1".into())))
            .unwrap();

        let user = f.app.get_user(GetUserOptions::default()).await.unwrap();

        assert_eq!(user, None);
        assert_eq!(f.app.token_store(None).unwrap().get(), TokenPair::empty());
        assert!(f.app.get_session(None).unwrap().is_known_to_be_invalid());
    }

    #[tokio::test]
    async fn test_credential_sign_in_outcomes() {
        let f = fixture(Some(TokenStoreInit::Memory));
        f.server
            .set_credential_result(Err(KnownError::EmailPasswordMismatch));

        let outcome = f
            .app
            .sign_in_with_credential("ada@example.com", "wrong", false)
            .await
            .unwrap();
        assert_eq!(outcome, Err(KnownError::EmailPasswordMismatch));
        assert!(f.app.token_store(None).unwrap().get().is_empty());

        f.server.set_credential_result(Ok(tokens("a1", "r1", false)));
        f.app
            .sign_in_with_credential("ada@example.com", "right", true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            f.app.token_store(None).unwrap().get(),
            TokenPair::new(Some("a1".into()), Some("r1".into()))
        );
        // no_redirect
        assert!(f.location.history().is_empty());
    }

    #[tokio::test]
    async fn test_sign_in_needs_a_persistent_token_store() {
        let request: Arc<dyn RequestLike> = Arc::new(RequestHeaders::new());
        for init in [signed_in("a0", "r0"), TokenStoreInit::Request(request)] {
            let f = fixture(Some(init));
            f.server.set_credential_result(Ok(tokens("a1", "r1", false)));

            let direct = f
                .app
                .sign_in_to_account_with_tokens(&TokenPair::new(Some("a1".into()), Some("r1".into())));
            assert!(matches!(direct, Err(AuthError::Configuration(_))));

            let credential = f
                .app
                .sign_in_with_credential("ada@example.com", "right", false)
                .await;
            assert!(matches!(credential, Err(AuthError::Configuration(_))));
            assert!(matches!(
                f.app.sign_in_with_oauth("github").await,
                Err(AuthError::Configuration(_))
            ));
            assert!(f.location.history().is_empty());
        }
    }

    #[tokio::test]
    async fn test_cache_entries_of_dropped_token_stores_are_evicted() {
        let f = fixture(Some(TokenStoreInit::Memory));
        f.server.add_user("a1", "u1");
        f.app
            .sign_in_to_account_with_tokens(&TokenPair::new(Some("a1".into()), Some("r1".into())))
            .unwrap();
        f.app.get_user(GetUserOptions::default()).await.unwrap();

        for i in 0..100 {
            let options = GetUserOptions {
                or: GetUserOr::ReturnNull,
                token_store: Some(signed_in("a1", &format!("request-{}", i))),
            };
            f.app.get_user(options).await.unwrap();
        }

        // The memory store's session plus at most the last request's
        assert!(f.app.inner.user_cache.len() <= 2);
        let user_calls = f.server.user_calls.load(Ordering::SeqCst);
        assert_eq!(user_calls, 101);

        // The long-lived store keeps its cached user
        f.app.get_user(GetUserOptions::default()).await.unwrap();
        assert_eq!(f.server.user_calls.load(Ordering::SeqCst), user_calls);
    }

    #[tokio::test]
    async fn test_sign_out() {
        let f = fixture(Some(TokenStoreInit::Memory));
        f.server.add_user("a1", "u1");
        f.app
            .sign_in_to_account_with_tokens(&TokenPair::new(Some("a1".into()), Some("r1".into())))
            .unwrap();
        let session = f.app.get_session(None).unwrap();
        f.app.get_user(GetUserOptions::default()).await.unwrap();

        f.app.sign_out(None).await.unwrap();

        assert_eq!(f.server.sign_out_calls.load(Ordering::SeqCst), 1);
        assert!(session.is_known_to_be_invalid());
        assert!(f.app.token_store(None).unwrap().get().is_empty());
        assert!(f.app.inner.user_cache.get_if_cached(&session).is_none());
        assert_eq!(f.location.href(), "http://localhost:3000/");
    }

    #[tokio::test]
    async fn test_teams_and_permissions() {
        let f = fixture(Some(signed_in("a1", "r1")));
        f.server.add_user("a1", "u1");
        f.server.set_teams(vec![TeamCrud {
            id: "t1".to_string(),
            display_name: "Core".to_string(),
            profile_image_url: None,
        }]);

        let teams = f.app.list_teams(None).await.unwrap();
        let permissions = f.app.list_team_permissions("t1", true, None).await.unwrap();
        let project = f.app.get_project().await.unwrap();

        assert_eq!(teams[0].display_name, "Core");
        assert_eq!(permissions[0].id, "$read_members");
        assert_eq!(project.config.oauth_providers.len(), 1);
    }

    #[tokio::test]
    async fn test_user_watch_follows_sign_in() {
        let f = fixture(Some(TokenStoreInit::Memory));
        f.server.add_user("a1", "u1");
        let watch = f.app.use_user(None).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = watch.subscribe(Box::new(move || {
            let _ = tx.send(());
        }));

        f.app
            .sign_in_to_account_with_tokens(&TokenPair::new(Some("a1".into()), Some("r1".into())))
            .unwrap();

        let user = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                rx.recv().await.unwrap();
                if let Some(Some(user)) = watch.snapshot() {
                    return user;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(user.id, "u1");
        sub.unsubscribe();
    }

    #[test]
    fn test_registry_reuses_matching_clients() {
        let registry = Arc::new(AppRegistry::new());
        let server: Arc<dyn AuthServer> = Arc::new(MockAuthServer::new());
        let config = ClientConfig::new("demo", "https://auth.example.com");

        let first = ClientApp::builder(config.clone(), server.clone())
            .token_store(TokenStoreInit::Memory)
            .unique_identifier(registry.clone(), "main")
            .build()
            .unwrap();
        let again = ClientApp::builder(config.clone(), server.clone())
            .token_store(TokenStoreInit::Memory)
            .unique_identifier(registry.clone(), "main")
            .build()
            .unwrap();
        assert!(first.ptr_eq(&again));
        assert!(registry.get("main").is_some());

        let conflicting = ClientApp::builder(config, server)
            .unique_identifier(registry.clone(), "main")
            .build();
        assert!(matches!(conflicting, Err(AuthError::Configuration(_))));

        drop(first);
        drop(again);
        assert!(registry.is_empty());
    }
}
