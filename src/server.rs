/// Auth server interface and its HTTP implementation
use crate::config::ClientConfig;
use crate::error::{AuthError, KnownError, Outcome, Result};
use crate::models::{ProjectCrud, TeamCrud, TeamPermissionCrud, UserCrud};
use crate::token_store::TokenPair;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

/// Tokens handed out by a successful sign-in
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SignInTokens {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub is_new_user: bool,
}

impl SignInTokens {
    pub fn to_pair(&self) -> TokenPair {
        TokenPair::new(
            Some(self.access_token.clone()),
            Some(self.refresh_token.clone()),
        )
    }
}

/// Parameters of the provider authorization URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthUrlRequest {
    pub provider: String,
    pub redirect_url: String,
    pub error_redirect_url: String,
    pub code_challenge: String,
    pub state: String,
    pub provider_scope: Option<String>,
}

/// The remote auth server
///
/// Errors follow one convention: an invalid refresh token is
/// [`AuthError::RefreshTokenInvalid`], a rejected access token is
/// [`AuthError::InvalidAccessToken`], expected sign-in failures are
/// [`AuthError::Known`] (or an [`Outcome`] where the signature says so) and
/// transport failures are [`AuthError::Network`].
#[async_trait]
pub trait AuthServer: Send + Sync {
    /// Exchange a refresh token for a new access token
    async fn refresh(&self, refresh_token: &str) -> Result<String>;

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_url: &str,
    ) -> Result<SignInTokens>;

    async fn get_oauth_url(&self, request: &OAuthUrlRequest) -> Result<String>;

    async fn sign_out(&self, tokens: &TokenPair) -> Result<()>;

    async fn sign_in_with_credential(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Outcome<SignInTokens>>;

    async fn sign_up_with_credential(
        &self,
        email: &str,
        password: &str,
        verification_callback_url: &str,
    ) -> Result<Outcome<SignInTokens>>;

    async fn sign_in_with_magic_link(&self, code: &str) -> Result<Outcome<SignInTokens>>;

    /// `None` when the token is valid but does not belong to a user
    async fn get_current_user(&self, access_token: &str) -> Result<Option<UserCrud>>;

    async fn list_teams(&self, access_token: &str) -> Result<Vec<TeamCrud>>;

    async fn list_team_permissions(
        &self,
        access_token: &str,
        team_id: &str,
        recursive: bool,
    ) -> Result<Vec<TeamPermissionCrud>>;

    async fn get_project(&self) -> Result<ProjectCrud>;
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct ItemsResponse<T> {
    items: Vec<T>,
}

#[derive(Serialize)]
struct CredentialBody<'a> {
    email: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    verification_callback_url: Option<&'a str>,
}

/// Map a non-success response onto the crate's error convention
fn error_from_response(status: StatusCode, body: &str) -> AuthError {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|body| body.code.clone())
        .unwrap_or_default();
    let message = parsed
        .and_then(|body| body.error)
        .unwrap_or_else(|| body.to_string());

    match code.as_str() {
        "REFRESH_TOKEN_NOT_FOUND_OR_EXPIRED" | "REFRESH_TOKEN_ERROR" | "INVALID_REFRESH_TOKEN" => {
            AuthError::RefreshTokenInvalid
        }
        "INVALID_ACCESS_TOKEN" | "ACCESS_TOKEN_EXPIRED" | "UNPARSABLE_ACCESS_TOKEN" => {
            AuthError::InvalidAccessToken
        }
        _ => match KnownError::from_code(&code, &message) {
            Some(known) => AuthError::Known(known),
            None if status == StatusCode::UNAUTHORIZED => AuthError::InvalidAccessToken,
            None if matches!(
                status,
                StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
            ) =>
            {
                AuthError::Network(format!("{}: {}", status, message))
            }
            None => AuthError::InvalidResponse(format!("{}: {}", status, message)),
        },
    }
}

/// Lift known errors out of `result` into an [`Outcome`]
fn into_outcome<T>(result: Result<T>) -> Result<Outcome<T>> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(AuthError::Known(known)) => Ok(Err(known)),
        Err(err) => Err(err),
    }
}

/// [`AuthServer`] speaking JSON over HTTP
pub struct HttpAuthServer {
    client: reqwest::Client,
    api_url: Url,
    project_id: String,
    publishable_client_key: Option<String>,
}

impl HttpAuthServer {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let api_url = Url::parse(&base)
            .and_then(|base| base.join("api/v1/"))
            .map_err(|e| AuthError::Configuration(format!("Invalid base URL {}: {}", config.base_url, e)))?;

        let client = reqwest::Client::builder()
            .timeout(config.requests.timeout())
            .build()?;

        Ok(Self {
            client,
            api_url,
            project_id: config.project_id.clone(),
            publishable_client_key: config.publishable_client_key.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.api_url
            .join(path)
            .map_err(|e| AuthError::Configuration(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let mut request = self
            .client
            .request(method, self.endpoint(path)?)
            .header("x-project-id", &self.project_id);
        if let Some(key) = &self.publishable_client_key {
            request = request.header("x-publishable-client-key", key);
        }
        Ok(request)
    }

    fn authorized(&self, method: Method, path: &str, access_token: &str) -> Result<RequestBuilder> {
        Ok(self.request(method, path)?.header("x-access-token", access_token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<String> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            debug!(%status, "auth server returned an error");
            return Err(error_from_response(status, &body));
        }
        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let body = self.send(request).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl AuthServer for HttpAuthServer {
    async fn refresh(&self, refresh_token: &str) -> Result<String> {
        let request = self
            .request(Method::POST, "auth/sessions/current/refresh")?
            .header("x-refresh-token", refresh_token);
        let response: RefreshResponse = self.send_json(request).await?;
        Ok(response.access_token)
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_url: &str,
    ) -> Result<SignInTokens> {
        let client_secret = self.publishable_client_key.as_deref().unwrap_or_default();
        let request = self.request(Method::POST, "auth/oauth/token")?.form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", code_verifier),
            ("redirect_uri", redirect_url),
            ("client_id", self.project_id.as_str()),
            ("client_secret", client_secret),
        ]);
        self.send_json(request).await
    }

    async fn get_oauth_url(&self, request: &OAuthUrlRequest) -> Result<String> {
        let mut url = self.endpoint(&format!(
            "auth/oauth/authorize/{}",
            urlencoding::encode(&request.provider.to_lowercase())
        ))?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.project_id)
                .append_pair(
                    "client_secret",
                    self.publishable_client_key.as_deref().unwrap_or_default(),
                )
                .append_pair("redirect_uri", &request.redirect_url)
                .append_pair("scope", "legacy")
                .append_pair("state", &request.state)
                .append_pair("grant_type", "authorization_code")
                .append_pair("code_challenge", &request.code_challenge)
                .append_pair("code_challenge_method", "S256")
                .append_pair("response_type", "code")
                .append_pair("type", "authenticate")
                .append_pair("error_redirect_url", &request.error_redirect_url);
            if let Some(scope) = &request.provider_scope {
                query.append_pair("provider_scope", scope);
            }
        }

        Ok(url.into())
    }

    async fn sign_out(&self, tokens: &TokenPair) -> Result<()> {
        let Some(refresh_token) = &tokens.refresh_token else {
            warn!("signing out a session without refresh token; nothing to revoke");
            return Ok(());
        };
        let request = self
            .request(Method::DELETE, "auth/sessions/current")?
            .header("x-refresh-token", refresh_token);
        self.send(request).await.map(|_| ())
    }

    async fn sign_in_with_credential(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Outcome<SignInTokens>> {
        let request = self
            .request(Method::POST, "auth/password/sign-in")?
            .json(&CredentialBody {
                email,
                password,
                verification_callback_url: None,
            });
        into_outcome(self.send_json(request).await)
    }

    async fn sign_up_with_credential(
        &self,
        email: &str,
        password: &str,
        verification_callback_url: &str,
    ) -> Result<Outcome<SignInTokens>> {
        let request = self
            .request(Method::POST, "auth/password/sign-up")?
            .json(&CredentialBody {
                email,
                password,
                verification_callback_url: Some(verification_callback_url),
            });
        into_outcome(self.send_json(request).await)
    }

    async fn sign_in_with_magic_link(&self, code: &str) -> Result<Outcome<SignInTokens>> {
        let request = self
            .request(Method::POST, "auth/otp/sign-in")?
            .json(&serde_json::json!({ "code": code }));
        into_outcome(self.send_json(request).await)
    }

    async fn get_current_user(&self, access_token: &str) -> Result<Option<UserCrud>> {
        let request = self.authorized(Method::GET, "users/me", access_token)?;
        self.send_json(request).await
    }

    async fn list_teams(&self, access_token: &str) -> Result<Vec<TeamCrud>> {
        let request = self
            .authorized(Method::GET, "teams", access_token)?
            .query(&[("user_id", "me")]);
        let response: ItemsResponse<TeamCrud> = self.send_json(request).await?;
        Ok(response.items)
    }

    async fn list_team_permissions(
        &self,
        access_token: &str,
        team_id: &str,
        recursive: bool,
    ) -> Result<Vec<TeamPermissionCrud>> {
        let recursive = if recursive { "true" } else { "false" };
        let request = self
            .authorized(Method::GET, "team-permissions", access_token)?
            .query(&[("team_id", team_id), ("user_id", "me"), ("recursive", recursive)]);
        let response: ItemsResponse<TeamPermissionCrud> = self.send_json(request).await?;
        Ok(response.items)
    }

    async fn get_project(&self) -> Result<ProjectCrud> {
        let request = self.request(Method::GET, "projects/current")?;
        self.send_json(request).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scriptable in-process [`AuthServer`]
    pub(crate) struct MockAuthServer {
        pub refresh_calls: AtomicUsize,
        pub exchange_calls: AtomicUsize,
        pub sign_out_calls: AtomicUsize,
        pub user_calls: AtomicUsize,
        pub team_calls: AtomicUsize,
        refresh_result: Mutex<Result<String>>,
        refresh_delay: Mutex<Duration>,
        exchange_result: Mutex<Result<SignInTokens>>,
        credential_result: Mutex<Outcome<SignInTokens>>,
        users: Mutex<HashMap<String, UserCrud>>,
        teams: Mutex<Vec<TeamCrud>>,
    }

    impl MockAuthServer {
        pub(crate) fn new() -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                exchange_calls: AtomicUsize::new(0),
                sign_out_calls: AtomicUsize::new(0),
                user_calls: AtomicUsize::new(0),
                team_calls: AtomicUsize::new(0),
                refresh_result: Mutex::new(Ok("fresh-access".to_string())),
                refresh_delay: Mutex::new(Duration::ZERO),
                exchange_result: Mutex::new(Ok(tokens("a1", "r1", false))),
                credential_result: Mutex::new(Ok(tokens("a1", "r1", false))),
                users: Mutex::new(HashMap::new()),
                teams: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn set_refresh_result(&self, result: Result<String>) {
            *self.refresh_result.lock() = result;
        }

        pub(crate) fn set_refresh_delay(&self, delay: Duration) {
            *self.refresh_delay.lock() = delay;
        }

        pub(crate) fn set_exchange_result(&self, result: Result<SignInTokens>) {
            *self.exchange_result.lock() = result;
        }

        pub(crate) fn set_credential_result(&self, result: Outcome<SignInTokens>) {
            *self.credential_result.lock() = result;
        }

        /// Accept `access_token` as belonging to `user_id`
        pub(crate) fn add_user(&self, access_token: &str, user_id: &str) {
            self.users.lock().insert(access_token.to_string(), user(user_id));
        }

        pub(crate) fn set_teams(&self, teams: Vec<TeamCrud>) {
            *self.teams.lock() = teams;
        }

        fn check_access(&self, access_token: &str) -> Result<Option<UserCrud>> {
            match self.users.lock().get(access_token) {
                Some(user) => Ok(Some(user.clone())),
                None => Err(AuthError::InvalidAccessToken),
            }
        }
    }

    pub(crate) fn tokens(access: &str, refresh: &str, is_new_user: bool) -> SignInTokens {
        SignInTokens {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            is_new_user,
        }
    }

    pub(crate) fn user(id: &str) -> UserCrud {
        UserCrud {
            id: id.to_string(),
            display_name: Some(format!("User {}", id)),
            primary_email: Some(format!("{}@example.com", id)),
            primary_email_verified: true,
            profile_image_url: None,
            signed_up_at_millis: 1_700_000_000_000,
            selected_team_id: None,
            oauth_providers: Vec::new(),
            client_metadata: None,
        }
    }

    #[async_trait]
    impl AuthServer for MockAuthServer {
        async fn refresh(&self, _refresh_token: &str) -> Result<String> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.refresh_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.refresh_result.lock().clone()
        }

        async fn exchange_code(
            &self,
            _code: &str,
            _code_verifier: &str,
            _redirect_url: &str,
        ) -> Result<SignInTokens> {
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.exchange_result.lock().clone()
        }

        async fn get_oauth_url(&self, request: &OAuthUrlRequest) -> Result<String> {
            Ok(format!(
                "https://auth.example.com/authorize/{}?state={}&code_challenge={}",
                request.provider, request.state, request.code_challenge
            ))
        }

        async fn sign_out(&self, _tokens: &TokenPair) -> Result<()> {
            self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn sign_in_with_credential(
            &self,
            _email: &str,
            _password: &str,
        ) -> Result<Outcome<SignInTokens>> {
            Ok(self.credential_result.lock().clone())
        }

        async fn sign_up_with_credential(
            &self,
            _email: &str,
            _password: &str,
            _verification_callback_url: &str,
        ) -> Result<Outcome<SignInTokens>> {
            Ok(self.credential_result.lock().clone())
        }

        async fn sign_in_with_magic_link(&self, _code: &str) -> Result<Outcome<SignInTokens>> {
            Ok(self.credential_result.lock().clone())
        }

        async fn get_current_user(&self, access_token: &str) -> Result<Option<UserCrud>> {
            self.user_calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.check_access(access_token)
        }

        async fn list_teams(&self, access_token: &str) -> Result<Vec<TeamCrud>> {
            self.team_calls.fetch_add(1, Ordering::SeqCst);
            self.check_access(access_token)?;
            Ok(self.teams.lock().clone())
        }

        async fn list_team_permissions(
            &self,
            access_token: &str,
            _team_id: &str,
            _recursive: bool,
        ) -> Result<Vec<TeamPermissionCrud>> {
            self.check_access(access_token)?;
            Ok(vec![TeamPermissionCrud {
                id: "$read_members".to_string(),
            }])
        }

        async fn get_project(&self) -> Result<ProjectCrud> {
            serde_json::from_value(serde_json::json!({
                "id": "demo",
                "display_name": "Demo",
                "config": {"oauth_providers": [{"id": "github", "type": "shared"}]}
            }))
            .map_err(AuthError::from)
        }
    }
}
