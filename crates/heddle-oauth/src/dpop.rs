//! DPoP (RFC 9449) proof construction and nonce handling.
//!
//! Nonces are cached per server origin, process-wide. Benign races on the
//! cache are acceptable: a stale value costs at most one extra retry, since
//! the server re-challenges with a fresh `DPoP-Nonce` header.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use heddle_common::HttpClient;
use http::header::{AUTHORIZATION, InvalidHeaderValue};
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode};
use jose_jwa::{Algorithm, Signing};
use jose_jwk::{Jwk, crypto};
use sha2::{Digest, Sha256};
use smol_str::SmolStr;
use url::Url;

use crate::error::{OAuthError, Result, SharedError};
use crate::jose::create_signed_jwt;
use crate::jose::jws::Header;
use crate::jose::jwt::{Claims, PublicClaims, RegisteredClaims};
use crate::utils::{public_jwk, signing_key_from_jwk};

pub const JWT_HEADER_TYP_DPOP: &str = "dpop+jwt";
pub const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";

/// Proof lifetime in seconds (`exp = iat + 300`).
const PROOF_LIFETIME_SECS: i64 = 300;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum DpopError {
    #[error("crypto error: {0:?}")]
    #[diagnostic(
        code(heddle_oauth::dpop::jwk),
        help("the session's DPoP key must be an EC P-256 JWK")
    )]
    JwkCrypto(crypto::Error),
    #[error("key is not a P-256 secret key")]
    #[diagnostic(code(heddle_oauth::dpop::unsupported_key))]
    UnsupportedKey,
    #[error(transparent)]
    #[diagnostic(code(heddle_oauth::dpop::serde))]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    #[diagnostic(code(heddle_oauth::dpop::header))]
    InvalidHeaderValue(#[from] InvalidHeaderValue),
    #[error(transparent)]
    #[diagnostic(code(heddle_oauth::dpop::http))]
    Http(#[from] http::Error),
}

static NONCE_CACHE: LazyLock<RwLock<HashMap<String, SmolStr>>> = LazyLock::new(Default::default);

/// The nonce-cache key: scheme + host + port.
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// The most recently observed nonce for this URL's origin, if any.
pub fn cached_nonce(url: &Url) -> Option<SmolStr> {
    NONCE_CACHE.read().ok()?.get(&origin_of(url)).cloned()
}

/// Record the `DPoP-Nonce` header from a response, unconditionally.
pub fn observe_nonce(url: &Url, headers: &HeaderMap) {
    if let Some(nonce) = headers
        .get(DPOP_NONCE_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        if let Ok(mut cache) = NONCE_CACHE.write() {
            cache.insert(origin_of(url), SmolStr::new(nonce));
        }
    }
}

/// Normalize a URL for the `htu` claim (RFC 9449 §4.2): scheme, host, port,
/// and path only; query string and fragment are stripped.
pub fn htu(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

/// Build a DPoP proof JWT for `(method, url)`, with the server nonce and the
/// access-token hash (`ath`) included when given.
pub fn build_proof(
    private_jwk: &Jwk,
    method: &Method,
    url: &Url,
    nonce: Option<&str>,
    access_token: Option<&str>,
) -> std::result::Result<String, DpopError> {
    let signing_key = signing_key_from_jwk(private_jwk)?;
    let mut header = Header::from(Algorithm::Signing(Signing::Es256));
    header.typ = Some(SmolStr::new_static(JWT_HEADER_TYP_DPOP));
    header.jwk = Some(public_jwk(&private_jwk.key)?);

    let now = Utc::now().timestamp();
    let claims = Claims {
        registered: RegisteredClaims {
            jti: Some(uuid::Uuid::new_v4().to_string().into()),
            iat: Some(now),
            exp: Some(now + PROOF_LIFETIME_SECS),
        },
        public: PublicClaims {
            htm: Some(method.as_str().to_ascii_uppercase().into()),
            htu: Some(htu(url).into()),
            ath: access_token
                .map(|token| URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes())).into()),
            nonce: nonce.map(SmolStr::new),
        },
    };
    Ok(create_signed_jwt(signing_key, &header, &claims)?)
}

/// Send a request to a token endpoint under a DPoP proof. AT Protocol
/// authorization servers answer nonce challenges with HTTP 400 plus a
/// `DPoP-Nonce` header; exactly one retry is made with the returned nonce.
pub async fn send_token_request<T>(
    client: &T,
    private_jwk: &Jwk,
    method: Method,
    url: &Url,
    headers: HeaderMap,
    body: Vec<u8>,
) -> Result<Response<Vec<u8>>>
where
    T: HttpClient + Sync,
{
    send_with_nonce_retry(
        client,
        private_jwk,
        method,
        url,
        headers,
        body,
        None,
        StatusCode::BAD_REQUEST,
    )
    .await
}

/// Send a resource-server (PDS/XRPC) request: `Authorization: DPoP <token>`
/// plus a proof carrying `ath`. Nonce challenges arrive as HTTP 401 with a
/// `DPoP-Nonce` header; exactly one retry is made.
pub async fn send_resource_request<T>(
    client: &T,
    private_jwk: &Jwk,
    access_token: &str,
    method: Method,
    url: &Url,
    mut headers: HeaderMap,
    body: Vec<u8>,
) -> Result<Response<Vec<u8>>>
where
    T: HttpClient + Sync,
{
    let authorization = HeaderValue::from_str(&format!("DPoP {access_token}"))
        .map_err(|e| OAuthError::Dpop(SharedError::new(DpopError::from(e))))?;
    headers.insert(AUTHORIZATION, authorization);
    send_with_nonce_retry(
        client,
        private_jwk,
        method,
        url,
        headers,
        body,
        Some(access_token),
        StatusCode::UNAUTHORIZED,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn send_with_nonce_retry<T>(
    client: &T,
    private_jwk: &Jwk,
    method: Method,
    url: &Url,
    mut headers: HeaderMap,
    body: Vec<u8>,
    access_token: Option<&str>,
    retry_status: StatusCode,
) -> Result<Response<Vec<u8>>>
where
    T: HttpClient + Sync,
{
    let proof = build_proof(
        private_jwk,
        &method,
        url,
        cached_nonce(url).as_deref(),
        access_token,
    )?;
    headers.insert("DPoP", parse_header_value(&proof)?);
    let response = send(client, &method, url, &headers, body.clone()).await?;
    observe_nonce(url, response.headers());

    if response.status() != retry_status || !response.headers().contains_key(DPOP_NONCE_HEADER) {
        return Ok(response);
    }

    // One retry with the nonce the server just handed back.
    let proof = build_proof(
        private_jwk,
        &method,
        url,
        cached_nonce(url).as_deref(),
        access_token,
    )?;
    headers.insert("DPoP", parse_header_value(&proof)?);
    let response = send(client, &method, url, &headers, body).await?;
    observe_nonce(url, response.headers());
    Ok(response)
}

fn parse_header_value(proof: &str) -> Result<HeaderValue> {
    proof
        .parse()
        .map_err(|e: InvalidHeaderValue| OAuthError::Dpop(SharedError::new(DpopError::from(e))))
}

async fn send<T>(
    client: &T,
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    body: Vec<u8>,
) -> Result<Response<Vec<u8>>>
where
    T: HttpClient + Sync,
{
    let mut builder = http::Request::builder()
        .method(method.clone())
        .uri(url.as_str());
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    let request = builder
        .body(body)
        .map_err(|e| OAuthError::Dpop(SharedError::new(DpopError::from(e))))?;
    client
        .send_http(request)
        .await
        .map_err(|e| OAuthError::network("http request failed", Some(SharedError::new(e))))
}
