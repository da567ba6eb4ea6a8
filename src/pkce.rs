/// PKCE verifier/challenge pairs and OAuth state values
/// RFC 7636: https://tools.ietf.org/html/rfc7636
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Code verifier and the S256 challenge derived from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkce {
    code_verifier: String,
    code_challenge: String,
}

impl Pkce {
    /// Generate a verifier from 32 random bytes
    ///
    /// ```
    /// use sitzung::pkce::Pkce;
    ///
    /// let pkce = Pkce::generate();
    /// assert_eq!(pkce.code_verifier().len(), 43);
    /// assert_eq!(Pkce::code_challenge_method(), "S256");
    /// ```
    pub fn generate() -> Self {
        let random_bytes: [u8; 32] = rand::thread_rng().gen();
        Self::from_verifier(URL_SAFE_NO_PAD.encode(random_bytes))
    }

    /// Rebuild the pair from a stored verifier
    pub fn from_verifier(code_verifier: impl Into<String>) -> Self {
        let code_verifier = code_verifier.into();
        let code_challenge = Self::challenge_for(&code_verifier);
        Self {
            code_verifier,
            code_challenge,
        }
    }

    /// base64url(SHA256(verifier)) without padding
    pub fn challenge_for(code_verifier: &str) -> String {
        let hash = Sha256::digest(code_verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hash)
    }

    pub fn code_verifier(&self) -> &str {
        &self.code_verifier
    }

    pub fn code_challenge(&self) -> &str {
        &self.code_challenge
    }

    pub fn code_challenge_method() -> &'static str {
        "S256"
    }
}

/// Random OAuth `state` parameter: 16 bytes, hex encoded
pub fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(state_bytes)
}
