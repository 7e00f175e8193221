mod metadata;
mod request;
mod response;
mod token;

pub use self::metadata::*;
pub use self::request::*;
pub use self::response::*;
pub use self::token::*;

use heddle_common::{Did, Handle};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

/// Caller-supplied options for `authorize`.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeOptions {
    /// Use this `state` instead of generating one.
    pub state: Option<SmolStr>,
    /// Override the default `atproto transition:generic` scope.
    pub scope: Option<SmolStr>,
    pub login_hint: Option<SmolStr>,
    pub prompt: Option<Prompt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    Login,
    None,
    Consent,
    SelectAccount,
}

impl Prompt {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prompt::Login => "login",
            Prompt::None => "none",
            Prompt::Consent => "consent",
            Prompt::SelectAccount => "select_account",
        }
    }
}

/// Query parameters delivered to the redirect URI.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<SmolStr>,
    #[serde(default)]
    pub state: Option<SmolStr>,
    /// RFC 9207 issuer identification.
    #[serde(default)]
    pub iss: Option<SmolStr>,
    #[serde(default)]
    pub error: Option<SmolStr>,
    #[serde(default)]
    pub error_description: Option<String>,
    /// Present when the server answered in JWT response mode (JARM), which
    /// this client does not support.
    #[serde(default)]
    pub response: Option<String>,
}

impl CallbackParams {
    /// Parse from the raw URL-encoded callback query string.
    pub fn from_query(query: &str) -> Result<Self, serde_html_form::de::Error> {
        serde_html_form::from_str(query)
    }
}

/// Authorization-flow state persisted under `pkce:<state>` from `authorize`
/// until the callback consumes it (or the 600 s TTL expires).
///
/// `handle`, `did`, and `pds_url` are unknown when authorization started from
/// an auth-server URL instead of a handle; the callback backfills them from
/// the token's `sub`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PkceState {
    pub code_verifier: SmolStr,
    pub auth_server: Url,
    pub issuer: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Handle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<Did>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pds_url: Option<Url>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_params_from_query() {
        let params =
            CallbackParams::from_query("code=abc&state=xyz&iss=https%3A%2F%2Fissuer.example.com")
                .unwrap();
        assert_eq!(params.code.as_deref(), Some("abc"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
        assert_eq!(params.iss.as_deref(), Some("https://issuer.example.com"));
        assert!(params.error.is_none());
        assert!(params.response.is_none());
    }

    #[test]
    fn callback_params_error_case() {
        let params =
            CallbackParams::from_query("error=access_denied&error_description=user%20said%20no")
                .unwrap();
        assert_eq!(params.error.as_deref(), Some("access_denied"));
        assert_eq!(params.error_description.as_deref(), Some("user said no"));
    }

    #[test]
    fn pkce_state_round_trips_without_identity() {
        let state = PkceState {
            code_verifier: "verifier".into(),
            auth_server: Url::parse("https://issuer.example.com").unwrap(),
            issuer: Url::parse("https://issuer.example.com").unwrap(),
            handle: None,
            did: None,
            pds_url: None,
        };
        let value = serde_json::to_value(&state).unwrap();
        // "Not yet known" is represented by absence, not empty strings.
        assert!(value.get("handle").is_none());
        assert!(value.get("did").is_none());
        let back: PkceState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }
}
