/// Wire records returned by the auth server and the domain types built from them
use crate::error::AuthError;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthAccountCrud {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCrud {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub primary_email: Option<String>,
    #[serde(default)]
    pub primary_email_verified: bool,
    #[serde(default)]
    pub profile_image_url: Option<String>,
    pub signed_up_at_millis: u64,
    #[serde(default)]
    pub selected_team_id: Option<String>,
    #[serde(default)]
    pub oauth_providers: Vec<OAuthAccountCrud>,
    #[serde(default)]
    pub client_metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamCrud {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamPermissionCrud {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthProviderConfigCrud {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfigCrud {
    #[serde(default)]
    pub sign_up_enabled: bool,
    #[serde(default)]
    pub credential_enabled: bool,
    #[serde(default)]
    pub magic_link_enabled: bool,
    #[serde(default)]
    pub oauth_providers: Vec<OAuthProviderConfigCrud>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectCrud {
    pub id: String,
    pub display_name: String,
    pub config: ProjectConfigCrud,
}

/// Third-party account linked to a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedOAuthAccount {
    pub provider: String,
    pub account_id: String,
    pub email: Option<String>,
}

/// The signed-in user
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentUser {
    pub id: String,
    pub display_name: Option<String>,
    pub primary_email: Option<String>,
    pub primary_email_verified: bool,
    pub profile_image_url: Option<String>,
    pub signed_up_at: SystemTime,
    pub selected_team_id: Option<String>,
    pub oauth_accounts: Vec<LinkedOAuthAccount>,
    pub client_metadata: Option<serde_json::Value>,
}

impl CurrentUser {
    pub fn has_linked_provider(&self, provider: &str) -> bool {
        self.oauth_accounts
            .iter()
            .any(|account| account.provider == provider)
    }
}

impl TryFrom<UserCrud> for CurrentUser {
    type Error = AuthError;

    fn try_from(crud: UserCrud) -> Result<Self, Self::Error> {
        if crud.id.is_empty() {
            return Err(AuthError::InvalidResponse("user without id".into()));
        }

        let oauth_accounts = crud
            .oauth_providers
            .into_iter()
            .map(|account| LinkedOAuthAccount {
                provider: account.id,
                account_id: account.account_id,
                email: account.email,
            })
            .collect();

        Ok(Self {
            id: crud.id,
            display_name: crud.display_name,
            primary_email: crud.primary_email,
            primary_email_verified: crud.primary_email_verified,
            profile_image_url: crud.profile_image_url,
            signed_up_at: UNIX_EPOCH + Duration::from_millis(crud.signed_up_at_millis),
            selected_team_id: crud.selected_team_id,
            oauth_accounts,
            client_metadata: crud.client_metadata,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    pub id: String,
    pub display_name: String,
    pub profile_image_url: Option<String>,
}

impl TryFrom<TeamCrud> for Team {
    type Error = AuthError;

    fn try_from(crud: TeamCrud) -> Result<Self, Self::Error> {
        if crud.id.is_empty() {
            return Err(AuthError::InvalidResponse("team without id".into()));
        }
        Ok(Self {
            id: crud.id,
            display_name: crud.display_name,
            profile_image_url: crud.profile_image_url,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TeamPermission {
    pub id: String,
}

impl From<TeamPermissionCrud> for TeamPermission {
    fn from(crud: TeamPermissionCrud) -> Self {
        Self { id: crud.id }
    }
}

/// OAuth provider as configured for a project
///
/// Shared providers use the auth server's own OAuth application; standard
/// providers carry the project's client credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OAuthProviderConfig {
    Shared {
        id: String,
        enabled: bool,
    },
    Standard {
        id: String,
        enabled: bool,
        client_id: String,
        client_secret: String,
    },
}

impl OAuthProviderConfig {
    pub fn id(&self) -> &str {
        match self {
            Self::Shared { id, .. } | Self::Standard { id, .. } => id,
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Shared { enabled, .. } | Self::Standard { enabled, .. } => *enabled,
        }
    }
}

impl TryFrom<OAuthProviderConfigCrud> for OAuthProviderConfig {
    type Error = AuthError;

    fn try_from(crud: OAuthProviderConfigCrud) -> Result<Self, Self::Error> {
        match crud.kind.as_str() {
            "shared" => Ok(Self::Shared {
                id: crud.id,
                enabled: crud.enabled,
            }),
            "standard" => {
                let (Some(client_id), Some(client_secret)) = (crud.client_id, crud.client_secret)
                else {
                    return Err(AuthError::InvalidResponse(format!(
                        "standard OAuth provider {} without client credentials",
                        crud.id
                    )));
                };
                Ok(Self::Standard {
                    id: crud.id,
                    enabled: crud.enabled,
                    client_id,
                    client_secret,
                })
            }
            other => Err(AuthError::InvalidResponse(format!(
                "unknown OAuth provider type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    pub sign_up_enabled: bool,
    pub credential_enabled: bool,
    pub magic_link_enabled: bool,
    pub oauth_providers: Vec<OAuthProviderConfig>,
}

/// Client-visible project settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub display_name: String,
    pub config: ProjectConfig,
}

impl Project {
    pub fn enabled_oauth_providers(&self) -> impl Iterator<Item = &OAuthProviderConfig> {
        self.config
            .oauth_providers
            .iter()
            .filter(|provider| provider.is_enabled())
    }
}

impl TryFrom<ProjectCrud> for Project {
    type Error = AuthError;

    fn try_from(crud: ProjectCrud) -> Result<Self, Self::Error> {
        let oauth_providers = crud
            .config
            .oauth_providers
            .into_iter()
            .map(OAuthProviderConfig::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: crud.id,
            display_name: crud.display_name,
            config: ProjectConfig {
                sign_up_enabled: crud.config.sign_up_enabled,
                credential_enabled: crud.config.credential_enabled,
                magic_link_enabled: crud.config.magic_link_enabled,
                oauth_providers,
            },
        })
    }
}
