use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Code,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenGrantType {
    AuthorizationCode,
    RefreshToken,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub enum CodeChallengeMethod {
    S256,
}

/// Pushed Authorization Request form body (RFC 9126).
#[derive(Debug, Serialize)]
pub struct ParParameters<'a> {
    pub response_type: ResponseType,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scope: &'a str,
    pub state: &'a str,
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.3
    pub code_challenge: &'a str,
    pub code_challenge_method: CodeChallengeMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_hint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<&'a str>,
}

/// Authorization-code grant form body (RFC 6749 §4.1.3).
#[derive(Debug, Serialize)]
pub struct TokenRequestParameters<'a> {
    pub grant_type: TokenGrantType,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub code: &'a str,
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.5
    pub code_verifier: &'a str,
}

/// Refresh grant form body (RFC 6749 §6).
#[derive(Debug, Serialize)]
pub struct RefreshRequestParameters<'a> {
    pub grant_type: TokenGrantType,
    pub client_id: &'a str,
    pub refresh_token: &'a str,
}

/// Revocation form body (RFC 7009 §2.1).
#[derive(Debug, Serialize)]
pub struct RevocationRequestParameters<'a> {
    pub token: &'a str,
    pub client_id: &'a str,
}
