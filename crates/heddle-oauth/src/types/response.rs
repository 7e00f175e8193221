use serde::Deserialize;
use smol_str::SmolStr;

/// Success body of a PAR endpoint (RFC 9126 §2.2).
#[derive(Debug, Clone, Deserialize)]
pub struct ParResponse {
    pub request_uri: SmolStr,
    #[serde(default)]
    pub expires_in: Option<u32>,
}

/// Structured OAuth error body (RFC 6749 §5.2).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthErrorBody {
    #[serde(default)]
    pub error: Option<SmolStr>,
    #[serde(default)]
    pub error_description: Option<String>,
}
