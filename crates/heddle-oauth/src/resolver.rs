//! OAuth server discovery: from a PDS (or a bare auth-server URL) to
//! validated authorization-server metadata.

use heddle_common::{Handle, HttpClient};
use heddle_identity::{HandleResolver, ResolvedIdentity};
use http::StatusCode;
use serde_json::Value;
use smol_str::SmolStr;
use url::Url;

use crate::error::{OAuthError, Result, SharedError};
use crate::types::{AuthServerMetadata, ProtectedResourceMetadata};
use crate::validate::{require_https_url, validate_auth_server_metadata};

/// Where an `authorize` input leads: the validated authorization server, and
/// the account identity when the input was a handle.
#[derive(Debug, Clone)]
pub struct OAuthTarget {
    pub metadata: AuthServerMetadata,
    pub identity: Option<ResolvedIdentity>,
    pub pds_url: Option<Url>,
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("HTTP {0}")]
    Status(StatusCode),
    #[error("transport error: {0}")]
    Transport(#[source] SharedError),
    #[error("invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

async fn get_json<T>(http: &T, url: &Url) -> std::result::Result<Value, FetchError>
where
    T: HttpClient + Sync,
{
    let request = http::Request::builder()
        .method(http::Method::GET)
        .uri(url.as_str())
        .body(Vec::new())
        .map_err(|e| FetchError::Transport(SharedError::new(e)))?;
    let response = http
        .send_http(request)
        .await
        .map_err(|e| FetchError::Transport(SharedError::new(e)))?;
    if response.status() != StatusCode::OK {
        return Err(FetchError::Status(response.status()));
    }
    Ok(serde_json::from_slice(response.body())?)
}

/// Fetch and validate `<auth_server>/.well-known/oauth-authorization-server`.
pub async fn fetch_auth_server_metadata<T>(
    http: &T,
    auth_server: &Url,
) -> Result<AuthServerMetadata>
where
    T: HttpClient + Sync,
{
    let discovery_error = |source: Option<SharedError>| OAuthError::AuthServerDiscovery {
        url: SmolStr::new(auth_server.as_str()),
        source,
    };
    let url = auth_server
        .join("/.well-known/oauth-authorization-server")
        .map_err(|e| discovery_error(Some(SharedError::new(e))))?;
    let raw = get_json(http, &url)
        .await
        .map_err(|e| discovery_error(Some(SharedError::new(e))))?;
    validate_auth_server_metadata(&raw, auth_server)
}

/// Discover the authorization server governing a PDS.
///
/// Fetches `<pds>/.well-known/oauth-protected-resource`; when the document
/// names `authorization_servers`, the first entry wins. A PDS that does not
/// advertise one (404, or no list) is treated as its own authorization
/// server. The discovered server's metadata is then fetched and validated.
pub async fn discover_from_pds<T>(http: &T, pds: &Url) -> Result<AuthServerMetadata>
where
    T: HttpClient + Sync,
{
    let url = pds
        .join("/.well-known/oauth-protected-resource")
        .map_err(|e| OAuthError::PdsDiscovery {
            url: SmolStr::new(pds.as_str()),
            source: Some(SharedError::new(e)),
        })?;
    let auth_server = match get_json(http, &url).await {
        Ok(raw) => {
            let metadata: ProtectedResourceMetadata =
                serde_json::from_value(raw).map_err(|e| OAuthError::PdsDiscovery {
                    url: SmolStr::new(pds.as_str()),
                    source: Some(SharedError::new(e)),
                })?;
            match metadata
                .authorization_servers
                .and_then(|servers| servers.into_iter().next())
            {
                Some(server) => server,
                None => pds.clone(),
            }
        }
        Err(FetchError::Status(status)) => {
            tracing::debug!(pds = %pds, %status, "no protected-resource metadata, treating PDS as auth server");
            pds.clone()
        }
        Err(e) => {
            return Err(OAuthError::PdsDiscovery {
                url: SmolStr::new(pds.as_str()),
                source: Some(SharedError::new(e)),
            });
        }
    };
    fetch_auth_server_metadata(http, &auth_server).await
}

/// Resolve an `authorize` input. A string with an `https://` prefix is used
/// directly for metadata discovery (no identity yet); anything else must be
/// a syntactically valid handle and goes through the resolver chain.
pub async fn resolve_oauth<T>(
    http: &T,
    resolver: &dyn HandleResolver,
    input: &str,
) -> Result<OAuthTarget>
where
    T: HttpClient + Sync,
{
    if input.starts_with("https://") {
        let url = require_https_url(input, "authorization server")?;
        let metadata = discover_from_pds(http, &url).await?;
        return Ok(OAuthTarget {
            metadata,
            identity: None,
            pds_url: Some(url),
        });
    }

    let handle = Handle::new(input).map_err(|e| OAuthError::InvalidHandle {
        handle: SmolStr::new(input),
        source: e,
    })?;
    let identity =
        resolver
            .resolve(&handle)
            .await
            .map_err(|e| OAuthError::HandleResolution {
                handle: SmolStr::new(input),
                source: SharedError::new(e),
            })?;
    tracing::debug!(handle = %handle, did = %identity.did, pds = %identity.pds_url, "resolved handle");
    let metadata = discover_from_pds(http, &identity.pds_url).await?;
    Ok(OAuthTarget {
        metadata,
        pds_url: Some(identity.pds_url.clone()),
        identity: Some(identity),
    })
}
