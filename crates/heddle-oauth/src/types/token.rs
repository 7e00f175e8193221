use heddle_common::Did;
use smol_str::SmolStr;

/// A token-endpoint response that passed
/// [`crate::validate::validate_token_response`]: the token type is DPoP, the
/// scope covers `atproto`, `sub` is a DID, and `expires_in` is positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTokens {
    pub access_token: SmolStr,
    pub refresh_token: Option<SmolStr>,
    pub scope: SmolStr,
    /// The authenticated account. Authoritative once the token response has
    /// been validated.
    pub sub: Did,
    /// Lifetime in seconds.
    pub expires_in: i64,
}
