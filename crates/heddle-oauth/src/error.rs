use std::fmt;
use std::sync::Arc;

use heddle_common::{Did, Handle, IdentParseError};
use smol_str::SmolStr;

use crate::authstore::StorageError;

/// A cloneable, shareable error cause. Concurrent callers awaiting the same
/// underlying restore or refresh all observe the identical failure.
#[derive(Clone)]
pub struct SharedError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl SharedError {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    pub fn from_boxed(error: Box<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        Self(Arc::from(error))
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Errors emitted by the OAuth engine. The kinds are load-bearing: restore
/// and refresh inspect them to decide between re-authentication
/// ([`OAuthError::RefreshTokenExpired`]), caller-side retry
/// ([`OAuthError::Network`]), replay recovery, and plain failure.
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic)]
pub enum OAuthError {
    /// Client construction rejected the configuration
    #[error("invalid client configuration: {0}")]
    #[diagnostic(code(heddle_oauth::config))]
    Config(SmolStr),

    /// Syntactic handle rejection
    #[error("invalid handle: {handle}")]
    #[diagnostic(
        code(heddle_oauth::invalid_handle),
        help("handles look like `alice.example.com`")
    )]
    InvalidHandle {
        handle: SmolStr,
        #[source]
        source: IdentParseError,
    },

    /// No resolver in the chain produced a DID + PDS pair
    #[error("could not resolve handle {handle}")]
    #[diagnostic(code(heddle_oauth::handle_resolution))]
    HandleResolution {
        handle: SmolStr,
        #[source]
        source: SharedError,
    },

    /// Metadata fetch/parse failure at the PDS well-known endpoint
    #[error("failed to discover protected-resource metadata for {url}")]
    #[diagnostic(code(heddle_oauth::pds_discovery))]
    PdsDiscovery {
        url: SmolStr,
        #[source]
        source: Option<SharedError>,
    },

    /// Metadata fetch/parse failure at the authorization-server well-known
    /// endpoint
    #[error("failed to discover authorization-server metadata at {url}")]
    #[diagnostic(code(heddle_oauth::auth_server_discovery))]
    AuthServerDiscovery {
        url: SmolStr,
        #[source]
        source: Option<SharedError>,
    },

    /// Metadata present but malformed or violating the AT Protocol OAuth
    /// profile
    #[error("metadata validation failed: {0}")]
    #[diagnostic(code(heddle_oauth::metadata_validation))]
    MetadataValidation(String),

    /// Structured OAuth error from a token-ish endpoint
    #[error("token request failed ({})", .error_code.as_deref().unwrap_or("unknown_error"))]
    #[diagnostic(
        code(heddle_oauth::token_exchange),
        help("inspect `error_code` and `error_description` from the server")
    )]
    TokenExchange {
        error_code: Option<SmolStr>,
        error_description: Option<String>,
        status: Option<u16>,
    },

    /// The refresh token is no longer valid; the user must sign in again
    #[error("refresh token expired")]
    #[diagnostic(code(heddle_oauth::refresh_expired), help("re-authenticate the user"))]
    RefreshTokenExpired,

    /// The refresh token was revoked; the user must sign in again
    #[error("refresh token revoked")]
    #[diagnostic(code(heddle_oauth::refresh_revoked), help("re-authenticate the user"))]
    RefreshTokenRevoked,

    /// Token response malformed
    #[error("token response validation failed: {0}")]
    #[diagnostic(code(heddle_oauth::token_validation))]
    TokenValidation(String),

    /// The answering authorization server is not the one that governs the
    /// authenticated identity
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    #[diagnostic(
        code(heddle_oauth::issuer_mismatch),
        help("restart authorization against the correct server; `handle` and `did` identify the account when known")
    )]
    IssuerMismatch {
        expected: String,
        actual: String,
        handle: Option<Handle>,
        did: Option<Did>,
    },

    /// Callback state unknown or expired
    #[error("unknown or expired authorization state")]
    #[diagnostic(
        code(heddle_oauth::invalid_state),
        help("authorization requests expire after 10 minutes; start a new one")
    )]
    InvalidState,

    /// The authorization server answered the callback with an OAuth error
    #[error("authorization failed: {error}")]
    #[diagnostic(code(heddle_oauth::authorization))]
    Authorization {
        error: SmolStr,
        error_description: Option<String>,
    },

    /// DPoP key or proof construction failure
    #[error("DPoP proof construction failed")]
    #[diagnostic(code(heddle_oauth::dpop))]
    Dpop(#[source] SharedError),

    /// Storage capability failure
    #[error("storage error")]
    #[diagnostic(code(heddle_oauth::storage))]
    Storage(#[source] SharedError),

    /// Unexpected session-layer failure
    #[error("session error: {message}")]
    #[diagnostic(code(heddle_oauth::session))]
    Session {
        message: String,
        #[source]
        source: Option<SharedError>,
    },

    /// No stored session under the requested id
    #[error("session not found: {0}")]
    #[diagnostic(code(heddle_oauth::session_not_found))]
    SessionNotFound(SmolStr),

    /// Transient reachability failure; the caller may retry
    #[error("network error: {message}")]
    #[diagnostic(code(heddle_oauth::network), help("transient; safe to retry"))]
    Network {
        message: SmolStr,
        #[source]
        source: Option<SharedError>,
    },
}

pub type Result<T> = std::result::Result<T, OAuthError>;

impl From<StorageError> for OAuthError {
    fn from(error: StorageError) -> Self {
        OAuthError::Storage(SharedError::new(error))
    }
}

impl From<crate::dpop::DpopError> for OAuthError {
    fn from(error: crate::dpop::DpopError) -> Self {
        OAuthError::Dpop(SharedError::new(error))
    }
}

impl OAuthError {
    pub fn network(message: impl Into<SmolStr>, source: Option<SharedError>) -> Self {
        OAuthError::Network {
            message: message.into(),
            source,
        }
    }

    pub fn session(message: impl Into<String>, source: Option<SharedError>) -> Self {
        OAuthError::Session {
            message: message.into(),
            source,
        }
    }

    /// Whether this failure is a transient reachability problem: either a
    /// wrapped transport error or a message naming one.
    pub fn is_network(&self) -> bool {
        match self {
            OAuthError::Network { .. } => true,
            other => message_is_network_like(&other.to_string()),
        }
    }

    /// Whether a refresh failure means another concurrent refresher already
    /// spent the refresh token, so the fresh session can be read back from
    /// storage.
    pub fn is_refresh_replay(&self) -> bool {
        match self {
            OAuthError::TokenExchange {
                error_description: Some(description),
                ..
            } => description.contains("replayed"),
            other => other.to_string().contains("replayed"),
        }
    }

    /// Map a raw refresh-grant failure to its semantic kind: `invalid_grant`
    /// means the refresh token is dead (expired, or revoked when the server
    /// says so); transport problems surface as [`OAuthError::Network`].
    pub fn classify_refresh(self) -> Self {
        match self {
            OAuthError::TokenExchange {
                ref error_code,
                ref error_description,
                ..
            } if error_code.as_deref() == Some("invalid_grant") => {
                if error_description
                    .as_deref()
                    .is_some_and(|d| d.contains("revoked"))
                {
                    OAuthError::RefreshTokenRevoked
                } else {
                    OAuthError::RefreshTokenExpired
                }
            }
            other => other,
        }
    }
}

fn message_is_network_like(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["network", "timeout", "connection", "fetch"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_grant_classifies_as_expired() {
        let error = OAuthError::TokenExchange {
            error_code: Some("invalid_grant".into()),
            error_description: None,
            status: Some(400),
        };
        assert!(matches!(
            error.classify_refresh(),
            OAuthError::RefreshTokenExpired
        ));
    }

    #[test]
    fn invalid_grant_revoked_classifies_as_revoked() {
        let error = OAuthError::TokenExchange {
            error_code: Some("invalid_grant".into()),
            error_description: Some("refresh token was revoked".into()),
            status: Some(400),
        };
        assert!(matches!(
            error.classify_refresh(),
            OAuthError::RefreshTokenRevoked
        ));
    }

    #[test]
    fn replay_detection_reads_description() {
        let error = OAuthError::TokenExchange {
            error_code: Some("invalid_grant".into()),
            error_description: Some("refresh token replayed".into()),
            status: Some(400),
        };
        assert!(error.is_refresh_replay());
    }

    #[test]
    fn network_detection_by_message() {
        let error = OAuthError::network("connection reset by peer", None);
        assert!(error.is_network());
        assert!(!OAuthError::InvalidState.is_network());
    }
}
