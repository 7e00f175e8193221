//! The authenticated session: DPoP-bound tokens for one account, with expiry
//! arithmetic and a request helper that refreshes on 401.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use heddle_common::{Did, Handle, HttpClient};
use http::{HeaderMap, Method, Response, StatusCode};
use jose_jwk::Jwk;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use url::Url;

use crate::dpop;
use crate::error::Result;
use crate::types::ValidatedTokens;

/// A session counts as expired this long before nominal token expiry, so
/// refresh happens while the old token still works.
pub const EXPIRY_BUFFER_MS: i64 = 5 * 60 * 1000;

/// Injected by the owning client at session creation/restore; refreshes the
/// given session snapshot and returns the updated one. Held as a callback so
/// sessions do not hold a back-reference to their client.
pub type RefreshHook = Arc<dyn Fn(Session) -> BoxFuture<'static, Result<Session>> + Send + Sync>;

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub did: Did,
    pub handle: Handle,
    pub pds_url: Url,
    pub access_token: SmolStr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<SmolStr>,
    /// Created fresh at token-exchange time; owned exclusively by this
    /// session and destroyed with it.
    #[serde(rename = "dpopPrivateKeyJWK")]
    pub dpop_private_key_jwk: Jwk,
    #[serde(rename = "dpopPublicKeyJWK")]
    pub dpop_public_key_jwk: Jwk,
    /// Absolute wall-clock expiry instant, epoch milliseconds.
    pub token_expires_at: i64,
    #[serde(skip)]
    refresh_hook: Option<RefreshHook>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("did", &self.did)
            .field("handle", &self.handle)
            .field("pds_url", &self.pds_url.as_str())
            .field("token_expires_at", &self.token_expires_at)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.did == other.did
            && self.handle == other.handle
            && self.pds_url == other.pds_url
            && self.access_token == other.access_token
            && self.refresh_token == other.refresh_token
            && self.dpop_private_key_jwk == other.dpop_private_key_jwk
            && self.dpop_public_key_jwk == other.dpop_public_key_jwk
            && self.token_expires_at == other.token_expires_at
    }
}

impl Session {
    pub fn new(
        did: Did,
        handle: Handle,
        pds_url: Url,
        tokens: &ValidatedTokens,
        dpop_private_key_jwk: Jwk,
        dpop_public_key_jwk: Jwk,
    ) -> Self {
        Self {
            did,
            handle,
            pds_url,
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            dpop_private_key_jwk,
            dpop_public_key_jwk,
            token_expires_at: Utc::now().timestamp_millis() + tokens.expires_in * 1000,
            refresh_hook: None,
        }
    }

    /// Whether the access token is within the refresh buffer of expiry.
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp_millis() + EXPIRY_BUFFER_MS >= self.token_expires_at
    }

    pub fn time_until_expiry(&self) -> Duration {
        let remaining = self.token_expires_at - Utc::now().timestamp_millis();
        Duration::from_millis(remaining.max(0) as u64)
    }

    /// Apply a token-endpoint result. The refresh token is only overwritten
    /// when the server rotated it.
    pub fn update_tokens(
        &mut self,
        access_token: SmolStr,
        refresh_token: Option<SmolStr>,
        expires_in: i64,
    ) {
        self.access_token = access_token;
        if let Some(refresh_token) = refresh_token {
            self.refresh_token = Some(refresh_token);
        }
        self.token_expires_at = Utc::now().timestamp_millis() + expires_in * 1000;
    }

    pub fn set_refresh_hook(&mut self, hook: RefreshHook) {
        self.refresh_hook = Some(hook);
    }

    pub fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn from_json(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    /// Issue a DPoP-authenticated request against the PDS.
    ///
    /// The proof carries `ath`. A 401 nonce challenge is retried once inside
    /// the DPoP layer; a 401 that survives it triggers the attached refresh
    /// hook (when any) and one final retry with the new access token.
    /// Non-401 responses are returned as-is.
    pub async fn make_request<T>(
        &mut self,
        http: &T,
        method: Method,
        url: &Url,
        body: Option<Vec<u8>>,
        headers: Option<HeaderMap>,
    ) -> Result<Response<Vec<u8>>>
    where
        T: HttpClient + Sync,
    {
        let headers = headers.unwrap_or_default();
        let body = body.unwrap_or_default();
        let response = dpop::send_resource_request(
            http,
            &self.dpop_private_key_jwk,
            &self.access_token,
            method.clone(),
            url,
            headers.clone(),
            body.clone(),
        )
        .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let Some(hook) = self.refresh_hook.clone() else {
            return Ok(response);
        };

        tracing::debug!(did = %self.did, url = %url, "access token rejected, refreshing");
        let refreshed = hook(self.clone()).await?;
        self.access_token = refreshed.access_token.clone();
        self.refresh_token = refreshed.refresh_token.clone();
        self.token_expires_at = refreshed.token_expires_at;

        dpop::send_resource_request(
            http,
            &self.dpop_private_key_jwk,
            &self.access_token,
            method,
            url,
            headers,
            body,
        )
        .await
    }
}
