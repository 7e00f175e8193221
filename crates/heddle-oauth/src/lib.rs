//! AT Protocol OAuth 2.0 client engine.
//!
//! Authenticates end users to Personal Data Servers via handle-based login:
//! PKCE-backed authorization with Pushed Authorization Requests, DPoP-bound
//! tokens (RFC 9449) with per-origin nonce handling, issuer-verified token
//! exchange, and concurrency-safe session restore/refresh.
//!
//! ```no_run
//! # use heddle_oauth::{OAuthClient, OAuthClientConfig, MemoryAuthStore, AuthorizeOptions};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = OAuthClient::new(
//!     OAuthClientConfig::new(
//!         "https://app.example.com/client-metadata.json",
//!         "https://app.example.com/oauth/callback",
//!     ),
//!     MemoryAuthStore::new(),
//! )?;
//! let url = client
//!     .authorize("alice.example.net", AuthorizeOptions::default())
//!     .await?;
//! // Send the user to `url`; on return, feed the query string to
//! // `client.callback(CallbackParams::from_query(..)?)`.
//! # Ok(())
//! # }
//! ```

pub mod authstore;
pub mod client;
pub mod dpop;
pub mod error;
pub mod jose;
pub mod request;
pub mod resolver;
pub mod session;
pub mod types;
pub mod utils;
pub mod validate;

pub use authstore::{MemoryAuthStore, OAuthStorage, StorageError};
pub use client::{
    CallbackResult, OAuthClient, OAuthClientConfig, RequestLock, SessionDeletedCallback,
    SessionUpdatedCallback,
};
pub use error::{OAuthError, Result};
pub use session::Session;
pub use types::{AuthorizeOptions, CallbackParams, Prompt};
