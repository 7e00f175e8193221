//! Explicit field-by-field validation of incoming JSON documents. Raw
//! server responses are narrowed into typed records here; nothing downstream
//! touches unvalidated data.

use heddle_common::Did;
use serde_json::Value;
use smol_str::SmolStr;
use url::Url;

use crate::error::{OAuthError, Result};
use crate::types::{AuthServerMetadata, ValidatedTokens};

/// Parse `url` and require the `https` scheme.
pub fn require_https_url(url: &str, label: &str) -> Result<Url> {
    let parsed = Url::parse(url)
        .map_err(|e| OAuthError::MetadataValidation(format!("{label} is not a valid URL: {e}")))?;
    if parsed.scheme() != "https" {
        return Err(OAuthError::MetadataValidation(format!(
            "{label} must use HTTPS"
        )));
    }
    Ok(parsed)
}

fn required_str<'v>(raw: &'v Value, field: &str) -> Result<&'v str> {
    raw.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            OAuthError::MetadataValidation(format!("missing or empty `{field}` field"))
        })
}

fn optional_https_url(raw: &Value, field: &str) -> Result<Option<Url>> {
    match raw.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(require_https_url(s, field)?)),
        Some(_) => Err(OAuthError::MetadataValidation(format!(
            "`{field}` must be a string"
        ))),
    }
}

/// Validate a raw authorization-server metadata document fetched from
/// `fetched_from`. Enforces the AT Protocol OAuth profile: HTTPS everywhere,
/// issuer origin equal to the fetch origin, and ES256 among the advertised
/// DPoP algorithms when the list is present.
pub fn validate_auth_server_metadata(
    raw: &Value,
    fetched_from: &Url,
) -> Result<AuthServerMetadata> {
    if !raw.is_object() {
        return Err(OAuthError::MetadataValidation(
            "authorization server metadata must be a JSON object".into(),
        ));
    }

    let issuer = require_https_url(required_str(raw, "issuer")?, "issuer")?;
    if issuer.origin() != fetched_from.origin() {
        return Err(OAuthError::MetadataValidation(format!(
            "issuer {issuer} does not match the origin it was fetched from ({fetched_from})"
        )));
    }

    let authorization_endpoint = require_https_url(
        required_str(raw, "authorization_endpoint")?,
        "authorization_endpoint",
    )?;
    let token_endpoint = require_https_url(required_str(raw, "token_endpoint")?, "token_endpoint")?;
    let pushed_authorization_request_endpoint =
        optional_https_url(raw, "pushed_authorization_request_endpoint")?;
    let revocation_endpoint = optional_https_url(raw, "revocation_endpoint")?;

    let dpop_signing_alg_values_supported = match raw.get("dpop_signing_alg_values_supported") {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => {
            let algs: Vec<SmolStr> = items
                .iter()
                .filter_map(Value::as_str)
                .map(SmolStr::new)
                .collect();
            if !algs.iter().any(|alg| alg == "ES256") {
                return Err(OAuthError::MetadataValidation(
                    "dpop_signing_alg_values_supported must include ES256".into(),
                ));
            }
            Some(algs)
        }
        Some(_) => {
            return Err(OAuthError::MetadataValidation(
                "dpop_signing_alg_values_supported must be a list".into(),
            ));
        }
    };

    Ok(AuthServerMetadata {
        issuer,
        authorization_endpoint,
        token_endpoint,
        pushed_authorization_request_endpoint,
        revocation_endpoint,
        dpop_signing_alg_values_supported,
    })
}

/// Validate a raw token-endpoint response body.
pub fn validate_token_response(raw: &Value) -> Result<ValidatedTokens> {
    let invalid = |message: String| OAuthError::TokenValidation(message);

    let access_token = raw
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("missing or empty `access_token`".into()))?;

    let token_type = raw
        .get("token_type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing `token_type`".into()))?;
    if !token_type.eq_ignore_ascii_case("dpop") {
        return Err(invalid(format!(
            "token_type must be \"DPoP\", got {token_type:?}"
        )));
    }

    let scope = raw
        .get("scope")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("missing or empty `scope`".into()))?;
    if !scope.contains("atproto") {
        return Err(invalid(format!("scope must include \"atproto\", got {scope:?}")));
    }

    let sub = raw
        .get("sub")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("missing or empty `sub`".into()))?;
    if !sub.starts_with("did:") {
        return Err(invalid(format!("`sub` must start with \"did:\", got {sub:?}")));
    }
    let sub = Did::new(sub).map_err(|e| invalid(format!("`sub` is not a valid DID: {e}")))?;

    let expires_in = raw
        .get("expires_in")
        .and_then(Value::as_i64)
        .filter(|n| *n > 0)
        .ok_or_else(|| invalid("`expires_in` must be a positive number".into()))?;

    let refresh_token = match raw.get("refresh_token") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(SmolStr::new(s)),
        Some(_) => return Err(invalid("`refresh_token` must be a string".into())),
    };

    Ok(ValidatedTokens {
        access_token: SmolStr::new(access_token),
        refresh_token,
        scope: SmolStr::new(scope),
        sub,
        expires_in,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn https_url_check() {
        assert!(require_https_url("https://bsky.social", "issuer").is_ok());
        let err = require_https_url("http://bsky.social", "issuer").unwrap_err();
        assert!(err.to_string().contains("must use HTTPS"));
        assert!(require_https_url("not a url", "issuer").is_err());
    }

    #[test]
    fn accepts_well_formed_metadata() {
        let fetched_from = Url::parse("https://bsky.social").unwrap();
        let metadata = validate_auth_server_metadata(
            &json!({
                "issuer": "https://bsky.social",
                "authorization_endpoint": "https://bsky.social/oauth/authorize",
                "token_endpoint": "https://bsky.social/oauth/token",
                "pushed_authorization_request_endpoint": "https://bsky.social/oauth/par",
                "revocation_endpoint": "https://bsky.social/oauth/revoke",
                "dpop_signing_alg_values_supported": ["ES256"]
            }),
            &fetched_from,
        )
        .unwrap();
        assert_eq!(metadata.issuer.as_str(), "https://bsky.social/");
        assert_eq!(
            metadata.token_endpoint.as_str(),
            "https://bsky.social/oauth/token"
        );
        assert!(metadata.pushed_authorization_request_endpoint.is_some());
    }

    #[test]
    fn rejects_http_endpoint() {
        let fetched_from = Url::parse("https://bsky.social").unwrap();
        let err = validate_auth_server_metadata(
            &json!({
                "issuer": "https://bsky.social",
                "authorization_endpoint": "http://bsky.social/oauth/authorize",
                "token_endpoint": "https://bsky.social/oauth/token"
            }),
            &fetched_from,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must use HTTPS"));
    }

    #[test]
    fn rejects_issuer_origin_mismatch() {
        let fetched_from = Url::parse("https://bsky.social").unwrap();
        let err = validate_auth_server_metadata(
            &json!({
                "issuer": "https://evil.com",
                "authorization_endpoint": "https://bsky.social/a",
                "token_endpoint": "https://bsky.social/t"
            }),
            &fetched_from,
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn rejects_missing_es256() {
        let fetched_from = Url::parse("https://bsky.social").unwrap();
        let err = validate_auth_server_metadata(
            &json!({
                "issuer": "https://bsky.social",
                "authorization_endpoint": "https://bsky.social/a",
                "token_endpoint": "https://bsky.social/t",
                "dpop_signing_alg_values_supported": ["RS256"]
            }),
            &fetched_from,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ES256"));
    }

    #[test]
    fn accepts_valid_token_response() {
        let tokens = validate_token_response(&json!({
            "access_token": "at-1",
            "token_type": "DPoP",
            "scope": "atproto transition:generic",
            "sub": "did:plc:ewvi7nxzyoun6zhxrhs64oiz",
            "expires_in": 3600,
            "refresh_token": "rt-1"
        }))
        .unwrap();
        assert_eq!(tokens.access_token, "at-1");
        assert_eq!(tokens.sub.as_str(), "did:plc:ewvi7nxzyoun6zhxrhs64oiz");
        assert_eq!(tokens.expires_in, 3600);
    }

    #[test]
    fn token_type_is_case_insensitive() {
        assert!(
            validate_token_response(&json!({
                "access_token": "x",
                "token_type": "dpop",
                "scope": "atproto",
                "sub": "did:plc:abc",
                "expires_in": 3600
            }))
            .is_ok()
        );
    }

    #[test]
    fn rejects_bearer_token_type() {
        let err = validate_token_response(&json!({
            "access_token": "x",
            "token_type": "Bearer",
            "scope": "atproto",
            "sub": "did:plc:abc",
            "expires_in": 3600
        }))
        .unwrap_err();
        assert!(err.to_string().contains("DPoP"));
    }

    #[test]
    fn rejects_non_did_sub() {
        let err = validate_token_response(&json!({
            "access_token": "x",
            "token_type": "DPoP",
            "scope": "atproto transition:generic",
            "sub": "user:abc",
            "expires_in": 3600
        }))
        .unwrap_err();
        assert!(err.to_string().contains("did:"));
    }

    #[test]
    fn rejects_foreign_scope() {
        let err = validate_token_response(&json!({
            "access_token": "x",
            "token_type": "DPoP",
            "scope": "email profile",
            "sub": "did:plc:abc",
            "expires_in": 3600
        }))
        .unwrap_err();
        assert!(err.to_string().contains("atproto"));
    }

    #[test]
    fn rejects_non_positive_expiry() {
        let err = validate_token_response(&json!({
            "access_token": "x",
            "token_type": "DPoP",
            "scope": "atproto",
            "sub": "did:plc:abc",
            "expires_in": 0
        }))
        .unwrap_err();
        assert!(err.to_string().contains("expires_in"));
    }
}
