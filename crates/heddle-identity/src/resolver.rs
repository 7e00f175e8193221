use async_trait::async_trait;
use heddle_common::{Did, Handle, HttpClient, IdentParseError};
use http::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use smol_str::SmolStr;
use url::Url;

pub const DEFAULT_SLINGSHOT_URL: &str = "https://slingshot.microcosm.blue";
pub const DEFAULT_APPVIEW_URL: &str = "https://public.api.bsky.app";
pub const DEFAULT_PLC_DIRECTORY_URL: &str = "https://plc.directory";

/// Error type for identity resolution operations.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum IdentityError {
    /// Every step of the fallback chain failed
    #[error("no resolver could resolve handle {0}")]
    #[diagnostic(
        code(heddle_identity::not_found),
        help("check the handle exists and the resolver services are reachable")
    )]
    NotFound(SmolStr),

    /// Invalid well-known atproto-did content
    #[error("invalid well-known atproto-did content")]
    #[diagnostic(
        code(heddle_identity::invalid_well_known),
        help("expected the response body to be a DID")
    )]
    InvalidWellKnown,

    /// Missing PDS endpoint in DID document
    #[error("missing PDS endpoint in DID document for {0}")]
    #[diagnostic(
        code(heddle_identity::missing_pds),
        help("ensure the DID document contains an AtprotoPersonalDataServer service")
    )]
    MissingPdsEndpoint(Did),

    /// Malformed DID document
    #[error("invalid DID document: {0}")]
    #[diagnostic(code(heddle_identity::invalid_doc))]
    InvalidDoc(SmolStr),

    /// Unsupported DID method
    #[error("unsupported DID method: {0}")]
    #[diagnostic(
        code(heddle_identity::unsupported_method),
        help("supported DID methods: did:plc, did:web")
    )]
    UnsupportedDidMethod(Did),

    /// Transport-level error
    #[error("transport error")]
    #[diagnostic(
        code(heddle_identity::transport),
        help("check network connectivity and TLS configuration")
    )]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// HTTP status error
    #[error("HTTP {0}")]
    #[diagnostic(code(heddle_identity::http_status))]
    HttpStatus(StatusCode),

    /// Identifier validation error
    #[error(transparent)]
    #[diagnostic(code(heddle_identity::ident))]
    Ident(#[from] IdentParseError),

    /// URL construction error
    #[error(transparent)]
    #[diagnostic(code(heddle_identity::url))]
    Url(#[from] url::ParseError),

    /// Serialization/deserialization error
    #[error("serialization error")]
    #[diagnostic(code(heddle_identity::serde))]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// What handle resolution produces: the account DID and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub did: Did,
    pub handle: Option<Handle>,
    pub pds_url: Url,
}

/// Capability for resolving a handle to an identity.
#[async_trait]
pub trait HandleResolver: Send + Sync {
    async fn resolve(&self, handle: &Handle) -> Result<ResolvedIdentity>;
}

/// AT Protocol DID document, narrowed to the fields resolution needs.
#[derive(Debug, Clone, Deserialize)]
pub struct DidDocument {
    pub id: Did,
    #[serde(default, rename = "alsoKnownAs")]
    pub also_known_as: Vec<SmolStr>,
    #[serde(default)]
    pub service: Vec<Service>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
    pub id: SmolStr,
    #[serde(rename = "type")]
    pub r#type: SmolStr,
    #[serde(rename = "serviceEndpoint")]
    pub service_endpoint: Value,
}

impl DidDocument {
    /// The PDS endpoint: a service entry typed `AtprotoPersonalDataServer`
    /// or with id `#atproto_pds`, whose endpoint must be a string.
    pub fn pds_endpoint(&self) -> Result<Url> {
        let service = self
            .service
            .iter()
            .find(|s| s.r#type == "AtprotoPersonalDataServer" || s.id == "#atproto_pds")
            .ok_or_else(|| IdentityError::MissingPdsEndpoint(self.id.clone()))?;
        let endpoint = service.service_endpoint.as_str().ok_or_else(|| {
            IdentityError::InvalidDoc(SmolStr::new("serviceEndpoint is not a string"))
        })?;
        Ok(Url::parse(endpoint.trim_end_matches('/'))?)
    }

    /// The handle recovered from `alsoKnownAs` entries of the form
    /// `at://<handle>`, if any.
    pub fn handle(&self) -> Option<Handle> {
        self.also_known_as
            .iter()
            .filter_map(|aka| aka.strip_prefix("at://"))
            .find_map(|h| Handle::new(h).ok())
    }
}

/// Fetch and parse the DID document for `did` from its canonical location.
pub async fn fetch_did_document<T>(
    http: &T,
    plc_directory_url: &Url,
    did: &Did,
) -> Result<DidDocument>
where
    T: HttpClient + Sync,
{
    let url = match did.method() {
        // Not a join: a `did:` path would parse as a URL scheme.
        "plc" => {
            let mut url = plc_directory_url.clone();
            url.path_segments_mut()
                .map_err(|_| {
                    IdentityError::InvalidDoc(SmolStr::new("PLC directory URL cannot be a base"))
                })?
                .pop_if_empty()
                .push(did.as_str());
            url
        }
        "web" => {
            let domain = did
                .as_str()
                .strip_prefix("did:web:")
                .unwrap_or_default()
                .replace(':', "/");
            Url::parse(&format!("https://{domain}/.well-known/did.json"))?
        }
        _ => return Err(IdentityError::UnsupportedDidMethod(did.clone())),
    };
    let body = get_ok(http, &url).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Resolve a DID straight to its identity (PDS endpoint plus any handle the
/// document advertises).
pub async fn resolve_did<T>(http: &T, plc_directory_url: &Url, did: &Did) -> Result<ResolvedIdentity>
where
    T: HttpClient + Sync,
{
    let doc = fetch_did_document(http, plc_directory_url, did).await?;
    let pds_url = doc.pds_endpoint()?;
    Ok(ResolvedIdentity {
        handle: doc.handle(),
        did: doc.id,
        pds_url,
    })
}

/// The default resolver: Slingshot first, then the standard fallbacks.
#[derive(Clone)]
pub struct SlingshotResolver<T> {
    http: T,
    slingshot_url: Url,
    appview_url: Url,
    plc_directory_url: Url,
}

/// Slingshot mini-doc: DID, handle, and PDS in one response.
#[derive(Debug, Clone, Deserialize)]
struct MiniDoc {
    did: Did,
    handle: Handle,
    pds: SmolStr,
}

#[derive(Debug, Deserialize)]
struct ResolveHandleOutput {
    did: Did,
}

impl<T> SlingshotResolver<T>
where
    T: HttpClient + Sync,
{
    pub fn new(http: T) -> Self {
        Self {
            http,
            slingshot_url: Url::parse(DEFAULT_SLINGSHOT_URL).expect("valid url"),
            appview_url: Url::parse(DEFAULT_APPVIEW_URL).expect("valid url"),
            plc_directory_url: Url::parse(DEFAULT_PLC_DIRECTORY_URL).expect("valid url"),
        }
    }

    pub fn with_slingshot_url(mut self, url: Url) -> Self {
        self.slingshot_url = url;
        self
    }

    pub fn with_appview_url(mut self, url: Url) -> Self {
        self.appview_url = url;
        self
    }

    pub fn with_plc_directory_url(mut self, url: Url) -> Self {
        self.plc_directory_url = url;
        self
    }

    async fn resolve_mini_doc(&self, handle: &Handle) -> Result<ResolvedIdentity> {
        let mut url = self
            .slingshot_url
            .join("/xrpc/com.bad-example.identity.resolveMiniDoc")?;
        url.query_pairs_mut()
            .append_pair("identifier", handle.as_str());
        let body = get_ok(&self.http, &url).await?;
        let mini: MiniDoc = serde_json::from_slice(&body)?;
        Ok(ResolvedIdentity {
            did: mini.did,
            handle: Some(mini.handle),
            pds_url: Url::parse(mini.pds.trim_end_matches('/'))?,
        })
    }

    async fn resolve_handle_via(&self, base: &Url, handle: &Handle) -> Result<Did> {
        let mut url = base.join("/xrpc/com.atproto.identity.resolveHandle")?;
        url.query_pairs_mut().append_pair("handle", handle.as_str());
        let body = get_ok(&self.http, &url).await?;
        let output: ResolveHandleOutput = serde_json::from_slice(&body)?;
        Ok(output.did)
    }

    async fn resolve_well_known(&self, handle: &Handle) -> Result<Did> {
        // Only domain-shaped handles can host the well-known document.
        if !handle.as_str().contains('.') {
            return Err(IdentityError::InvalidWellKnown);
        }
        let url = Url::parse(&format!("https://{handle}/.well-known/atproto-did"))?;
        let body = get_ok(&self.http, &url).await?;
        let text = String::from_utf8_lossy(&body);
        let did = text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or(IdentityError::InvalidWellKnown)?;
        Did::new(did).map_err(|_| IdentityError::InvalidWellKnown)
    }

    async fn resolve_via_did_doc(&self, did: Did, handle: &Handle) -> Result<ResolvedIdentity> {
        let doc = fetch_did_document(&self.http, &self.plc_directory_url, &did).await?;
        let pds_url = doc.pds_endpoint()?;
        Ok(ResolvedIdentity {
            did: doc.id,
            handle: Some(handle.clone()),
            pds_url,
        })
    }
}

#[async_trait]
impl<T> HandleResolver for SlingshotResolver<T>
where
    T: HttpClient + Send + Sync,
{
    async fn resolve(&self, handle: &Handle) -> Result<ResolvedIdentity> {
        match self.resolve_mini_doc(handle).await {
            Ok(identity) => return Ok(identity),
            Err(e) => tracing::debug!(%handle, error = %e, "slingshot mini-doc failed"),
        }

        match self.resolve_handle_via(&self.slingshot_url, handle).await {
            Ok(did) => match self.resolve_via_did_doc(did, handle).await {
                Ok(identity) => return Ok(identity),
                Err(e) => tracing::debug!(%handle, error = %e, "slingshot resolveHandle failed"),
            },
            Err(e) => tracing::debug!(%handle, error = %e, "slingshot resolveHandle failed"),
        }

        match self.resolve_handle_via(&self.appview_url, handle).await {
            Ok(did) => match self.resolve_via_did_doc(did, handle).await {
                Ok(identity) => return Ok(identity),
                Err(e) => tracing::debug!(%handle, error = %e, "appview resolveHandle failed"),
            },
            Err(e) => tracing::debug!(%handle, error = %e, "appview resolveHandle failed"),
        }

        match self.resolve_well_known(handle).await {
            Ok(did) => match self.resolve_via_did_doc(did, handle).await {
                Ok(identity) => return Ok(identity),
                Err(e) => tracing::debug!(%handle, error = %e, "well-known lookup failed"),
            },
            Err(e) => tracing::debug!(%handle, error = %e, "well-known lookup failed"),
        }

        Err(IdentityError::NotFound(SmolStr::new(handle.as_str())))
    }
}

async fn get_ok<T>(http: &T, url: &Url) -> Result<Vec<u8>>
where
    T: HttpClient + Sync,
{
    let request = http::Request::builder()
        .method(http::Method::GET)
        .uri(url.as_str())
        .body(Vec::new())
        .map_err(|e| IdentityError::Transport(Box::new(e)))?;
    let response = http
        .send_http(request)
        .await
        .map_err(|e| IdentityError::Transport(Box::new(e)))?;
    if response.status() == StatusCode::OK {
        Ok(response.into_body())
    } else {
        Err(IdentityError::HttpStatus(response.status()))
    }
}
