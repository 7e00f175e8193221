use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

/// Validated authorization-server metadata (RFC 8414, narrowed to the fields
/// this engine uses). Produced only by
/// [`crate::validate::validate_auth_server_metadata`], which guarantees every
/// endpoint is HTTPS and the issuer origin matches where the document was
/// fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: Url,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed_authorization_request_endpoint: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpop_signing_alg_values_supported: Option<Vec<SmolStr>>,
}

/// Raw `/.well-known/oauth-protected-resource` document.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedResourceMetadata {
    #[serde(default)]
    pub authorization_servers: Option<Vec<Url>>,
}
