//! Form-encoded requests against the authorization server: PAR, the
//! authorization-code and refresh grants, and revocation.

use std::time::Duration;

use heddle_common::HttpClient;
use http::{HeaderMap, HeaderValue, Method, Response};
use jose_jwk::Jwk;
use serde::Serialize;
use url::Url;

use crate::dpop;
use crate::error::{OAuthError, Result, SharedError};
use crate::types::{
    AuthServerMetadata, OAuthErrorBody, ParParameters, ParResponse, RefreshRequestParameters,
    RevocationRequestParameters, TokenGrantType, TokenRequestParameters, ValidatedTokens,
};
use crate::validate::validate_token_response;

pub const DEFAULT_SCOPE: &str = "atproto transition:generic";
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

fn form_body<P: Serialize>(parameters: &P) -> Result<(HeaderMap, Vec<u8>)> {
    let body = serde_html_form::to_string(parameters)
        .map_err(|e| OAuthError::session("failed to encode request body", Some(SharedError::new(e))))?;
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static(FORM_CONTENT_TYPE),
    );
    Ok((headers, body.into_bytes()))
}

/// Turn a non-OK token-ish response into a structured error: the JSON
/// `{error, error_description}` body when the server sent one, the raw text
/// otherwise.
fn oauth_error_from_response(response: &Response<Vec<u8>>) -> OAuthError {
    let status = Some(response.status().as_u16());
    match serde_json::from_slice::<OAuthErrorBody>(response.body()) {
        Ok(body) if body.error.is_some() => OAuthError::TokenExchange {
            error_code: body.error,
            error_description: body.error_description,
            status,
        },
        _ => OAuthError::TokenExchange {
            error_code: None,
            error_description: Some(String::from_utf8_lossy(response.body()).into_owned()),
            status,
        },
    }
}

/// Submit a Pushed Authorization Request (RFC 9126) and return the
/// `request_uri` to place in the browser redirect.
pub async fn par<T>(
    http: &T,
    metadata: &AuthServerMetadata,
    parameters: ParParameters<'_>,
) -> Result<ParResponse>
where
    T: HttpClient + Sync,
{
    let endpoint = match &metadata.pushed_authorization_request_endpoint {
        Some(endpoint) => endpoint.clone(),
        // ATPROTO requires PAR; servers that omit the metadata field still
        // serve the conventional path.
        None => metadata
            .issuer
            .join("/oauth/par")
            .map_err(|e| OAuthError::MetadataValidation(format!("invalid issuer URL: {e}")))?,
    };
    let (headers, body) = form_body(&parameters)?;
    let mut builder = http::Request::builder()
        .method(Method::POST)
        .uri(endpoint.as_str());
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    let request = builder
        .body(body)
        .map_err(|e| OAuthError::session("failed to build PAR request", Some(SharedError::new(e))))?;
    let response = http
        .send_http(request)
        .await
        .map_err(|e| OAuthError::network("http request failed", Some(SharedError::new(e))))?;
    if response.status().is_success() {
        Ok(serde_json::from_slice(response.body()).map_err(|e| {
            OAuthError::MetadataValidation(format!("invalid PAR response body: {e}"))
        })?)
    } else {
        Err(oauth_error_from_response(&response))
    }
}

/// Exchange an authorization code for tokens (RFC 6749 §4.1.3) under a DPoP
/// proof, and validate the response.
pub async fn exchange_code<T>(
    http: &T,
    metadata: &AuthServerMetadata,
    dpop_jwk: &Jwk,
    client_id: &str,
    redirect_uri: &str,
    code: &str,
    code_verifier: &str,
) -> Result<ValidatedTokens>
where
    T: HttpClient + Sync,
{
    let parameters = TokenRequestParameters {
        grant_type: TokenGrantType::AuthorizationCode,
        client_id,
        redirect_uri,
        code,
        code_verifier,
    };
    token_request(http, &metadata.token_endpoint, dpop_jwk, &parameters).await
}

/// Refresh grant (RFC 6749 §6) under a DPoP proof, bounded by `timeout`.
pub async fn refresh_grant<T>(
    http: &T,
    token_endpoint: &Url,
    dpop_jwk: &Jwk,
    client_id: &str,
    refresh_token: &str,
    timeout: Duration,
) -> Result<ValidatedTokens>
where
    T: HttpClient + Sync,
{
    let parameters = RefreshRequestParameters {
        grant_type: TokenGrantType::RefreshToken,
        client_id,
        refresh_token,
    };
    match tokio::time::timeout(
        timeout,
        token_request(http, token_endpoint, dpop_jwk, &parameters),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(OAuthError::network("refresh request timed out", None)),
    }
}

async fn token_request<T, P>(
    http: &T,
    token_endpoint: &Url,
    dpop_jwk: &Jwk,
    parameters: &P,
) -> Result<ValidatedTokens>
where
    T: HttpClient + Sync,
    P: Serialize,
{
    let (headers, body) = form_body(parameters)?;
    let response =
        dpop::send_token_request(http, dpop_jwk, Method::POST, token_endpoint, headers, body)
            .await?;
    if response.status().is_success() {
        let raw: serde_json::Value = serde_json::from_slice(response.body())
            .map_err(|e| OAuthError::TokenValidation(format!("token response is not JSON: {e}")))?;
        validate_token_response(&raw)
    } else {
        Err(oauth_error_from_response(&response))
    }
}

/// Revoke a token (RFC 7009). The server's answer is ignored beyond status.
pub async fn revoke<T>(
    http: &T,
    revocation_endpoint: &Url,
    dpop_jwk: &Jwk,
    client_id: &str,
    token: &str,
) -> Result<()>
where
    T: HttpClient + Sync,
{
    let parameters = RevocationRequestParameters { token, client_id };
    let (headers, body) = form_body(&parameters)?;
    let response = dpop::send_token_request(
        http,
        dpop_jwk,
        Method::POST,
        revocation_endpoint,
        headers,
        body,
    )
    .await?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(oauth_error_from_response(&response))
    }
}
