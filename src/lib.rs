//! Sitzung - Client-side authentication sessions
//!
//! This library keeps a signed-in user's tokens, sessions and derived data
//! consistent for client applications talking to a hosted auth server.
//!
//! # Features
//!
//! - Token stores backed by memory, cookie jars (synchronized across
//!   processes by polling), request headers or explicit tokens
//! - Refreshable sessions with deduplicated refreshes and invalidation
//! - Deduplicating asynchronous caches that refresh when their session is
//!   invalidated
//! - OAuth 2.0 authorization code flow with PKCE (RFC 7636) whose callback
//!   is consumed exactly once
//!
//! # Example
//!
//! ```no_run
//! use sitzung::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> sitzung::error::Result<()> {
//! let config = ClientConfig::new("my-project", "https://auth.example.com");
//! let server = Arc::new(HttpAuthServer::new(&config)?);
//!
//! let app = ClientApp::builder(config, server)
//!     .token_store(TokenStoreInit::Memory)
//!     .build()?;
//!
//! match app.get_user(GetUserOptions::default()).await? {
//!     Some(user) => println!("Signed in as {}", user.id),
//!     None => println!("Not signed in"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod cache;
pub mod callback;
pub mod config;
pub mod cookie;
pub mod error;
pub mod models;
pub mod oauth;
pub mod pkce;
pub mod server;
pub mod session;
pub mod store;
pub mod token_store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::app::{
        AppRegistry, ClientApp, ClientAppBuilder, GetUserOptions, GetUserOr, Handler, SessionWatch,
        TeamsWatch, UserWatch,
    };
    pub use crate::cache::{AsyncCache, CacheMode, CacheState};
    pub use crate::callback::LoopbackCallback;
    pub use crate::config::{load_config, ClientConfig};
    pub use crate::cookie::{CookieJar, FileCookieJar, KeyringCookieJar, MemoryCookieJar};
    pub use crate::error::{AuthError, KnownError, Outcome};
    pub use crate::models::{CurrentUser, OAuthProviderConfig, Project, Team, TeamPermission};
    pub use crate::oauth::{Location, MemoryLocation, Navigator, OAuthFlow, SystemBrowser};
    pub use crate::server::{AuthServer, HttpAuthServer, SignInTokens};
    pub use crate::session::{AccessToken, Session, SessionRegistry};
    pub use crate::store::{Observable, Store, Subscription};
    pub use crate::token_store::{RequestHeaders, RequestLike, TokenPair, TokenStoreInit};
}
