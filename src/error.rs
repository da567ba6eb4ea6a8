/// Error types for session, cache and OAuth operations
use std::sync::Arc;
use thiserror::Error;

/// Expected, recoverable errors reported by the auth server.
///
/// These are handed back as values (see [`Outcome`]) from sign-in and
/// verification calls so that callers can render them as form errors
/// without matching on [`AuthError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KnownError {
    #[error("Verification code is invalid")]
    VerificationCodeInvalid,

    #[error("Verification code has expired")]
    VerificationCodeExpired,

    #[error("Wrong e-mail or password")]
    EmailPasswordMismatch,

    #[error("A user with this e-mail address already exists")]
    UserEmailAlreadyExists,

    #[error("Password does not meet the requirements: {0}")]
    PasswordRequirementsNotMet(String),

    #[error("Invalid TOTP code")]
    InvalidTotpCode,

    #[error("{code}: {message}")]
    Other { code: String, message: String },
}

impl KnownError {
    /// Map a server error code onto a known error
    ///
    /// Returns `None` for codes that are not expected sign-in outcomes.
    pub fn from_code(code: &str, message: &str) -> Option<Self> {
        let known = match code {
            "VERIFICATION_CODE_NOT_FOUND" | "VERIFICATION_CODE_INVALID" => {
                Self::VerificationCodeInvalid
            }
            "VERIFICATION_CODE_EXPIRED" | "VERIFICATION_CODE_ALREADY_USED" => {
                Self::VerificationCodeExpired
            }
            "EMAIL_PASSWORD_MISMATCH" => Self::EmailPasswordMismatch,
            "USER_EMAIL_ALREADY_EXISTS" => Self::UserEmailAlreadyExists,
            "PASSWORD_REQUIREMENTS_NOT_MET" | "PASSWORD_TOO_SHORT" | "PASSWORD_TOO_LONG" => {
                Self::PasswordRequirementsNotMet(message.to_string())
            }
            "INVALID_TOTP_CODE" => Self::InvalidTotpCode,
            _ => return None,
        };
        Some(known)
    }
}

#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Refresh token is invalid or has been revoked")]
    RefreshTokenInvalid,

    #[error("Access token is invalid or expired")]
    InvalidAccessToken,

    #[error(transparent)]
    Known(#[from] KnownError),

    #[error("OAuth error: {error}, description: {description:?}")]
    OAuthErrorResponse {
        error: String,
        description: Option<String>,
    },

    #[error("Error signing in during OAuth callback. Please try again: {0}")]
    CallbackExchange(Box<AuthError>),

    #[error("Cookies cannot be written in this context")]
    CookieWriteUnavailable,

    #[error("User is not signed in")]
    NotSignedIn,

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("HTTP request failed: {0}")]
    Http(Arc<reqwest::Error>),

    #[error("JSON parsing failed: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl AuthError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        // Connection-level failures are retried, everything else is surfaced as-is
        if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Network(err.to_string())
        } else {
            Self::Http(Arc::new(err))
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl From<std::io::Error> for AuthError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<config::ConfigError> for AuthError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Result of an operation whose expected failures are returned as values
pub type Outcome<T> = std::result::Result<T, KnownError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_error_codes() {
        assert_eq!(
            KnownError::from_code("EMAIL_PASSWORD_MISMATCH", ""),
            Some(KnownError::EmailPasswordMismatch)
        );
        assert_eq!(
            KnownError::from_code("PASSWORD_TOO_SHORT", "min 8"),
            Some(KnownError::PasswordRequirementsNotMet("min 8".to_string()))
        );
        assert_eq!(KnownError::from_code("SOMETHING_ELSE", "x"), None);
    }

    #[test]
    fn test_only_network_errors_are_transient() {
        assert!(AuthError::Network("reset".into()).is_transient());
        assert!(!AuthError::RefreshTokenInvalid.is_transient());
        assert!(!AuthError::Configuration("bad".into()).is_transient());
    }
}
