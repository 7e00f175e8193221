//! The OAuth client: authorize → callback → store/restore → refresh →
//! sign-out, with per-identity locking.
//!
//! Concurrency discipline: for a given session id, `restore` is
//! single-flight — concurrent callers await one underlying task and observe
//! the same outcome. For a given DID, `refresh` is single-flight under the
//! in-memory task map, or mutually exclusive under a caller-provided
//! [`RequestLock`] when coordination must span processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use heddle_common::HttpClient;
use heddle_identity::{HandleResolver, SlingshotResolver, resolver::DEFAULT_PLC_DIRECTORY_URL};
use jose_jwk::Jwk;
use serde::Serialize;
use smol_str::SmolStr;
use tokio::sync::Mutex;
use url::Url;

use crate::authstore::OAuthStorage;
use crate::error::{OAuthError, Result, SharedError};
use crate::request::{self, DEFAULT_REFRESH_TIMEOUT, DEFAULT_SCOPE};
use crate::resolver;
use crate::session::Session;
use crate::types::{
    AuthorizeOptions, CallbackParams, CodeChallengeMethod, ParParameters, PkceState, ResponseType,
};
use crate::utils;

/// Authorization-state records live this long before the callback must have
/// consumed them.
pub const PKCE_TTL: Duration = Duration::from_secs(600);

/// How long to wait before re-reading storage when a refresh token turns out
/// to have been replayed by a concurrent refresher.
const REPLAY_RECOVERY_DELAY: Duration = Duration::from_millis(200);

pub type SessionUpdatedCallback = Arc<dyn Fn(&str, &Session) + Send + Sync>;
pub type SessionDeletedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Distributed mutual-exclusion capability for refresh. `acquire` returns an
/// opaque guard; the lock is held until the guard drops, on every exit path
/// of the critical section.
#[async_trait]
pub trait RequestLock: Send + Sync {
    async fn acquire(&self, key: &str) -> Box<dyn std::any::Any + Send>;
}

/// Configuration for [`OAuthClient`]. `client_id` and `redirect_uri` are
/// required; everything else has a default.
pub struct OAuthClientConfig {
    /// URL hosting the client metadata document.
    pub client_id: String,
    /// Where the user returns after authorizing.
    pub redirect_uri: String,
    /// Scope requested at authorization time; defaults to
    /// `atproto transition:generic`.
    pub scope: Option<String>,
    /// Override the default Slingshot resolver chain.
    pub handle_resolver: Option<Arc<dyn HandleResolver>>,
    /// Base URL for the default resolver's Slingshot service.
    pub slingshot_url: Option<Url>,
    /// Base URL for DID-document lookups.
    pub plc_directory_url: Option<Url>,
    /// Timeout for refresh-grant requests; defaults to 30 s.
    pub refresh_timeout: Option<Duration>,
    /// Called with `(session_id, session)` after a successful callback and
    /// after every refresh.
    pub on_session_updated: Option<SessionUpdatedCallback>,
    /// Called with `session_id` on sign-out.
    pub on_session_deleted: Option<SessionDeletedCallback>,
    /// Distributed lock for refresh; the in-memory per-DID map is used when
    /// absent.
    pub request_lock: Option<Arc<dyn RequestLock>>,
}

impl OAuthClientConfig {
    pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            scope: None,
            handle_resolver: None,
            slingshot_url: None,
            plc_directory_url: None,
            refresh_timeout: None,
            on_session_updated: None,
            on_session_deleted: None,
            request_lock: None,
        }
    }
}

/// What a successful callback yields.
#[derive(Debug)]
pub struct CallbackResult {
    pub session: Session,
    pub state: SmolStr,
}

type SharedTask = Shared<BoxFuture<'static, Result<Session>>>;
type TaskMap = Mutex<HashMap<String, SharedTask>>;

struct ClientInner<S, T> {
    client_id: String,
    redirect_uri: String,
    scope: String,
    refresh_timeout: Duration,
    plc_directory_url: Url,
    storage: S,
    http: T,
    resolver: Arc<dyn HandleResolver>,
    on_session_updated: Option<SessionUpdatedCallback>,
    on_session_deleted: Option<SessionDeletedCallback>,
    request_lock: Option<Arc<dyn RequestLock>>,
    restore_locks: TaskMap,
    refresh_locks: TaskMap,
}

pub struct OAuthClient<S, T> {
    inner: Arc<ClientInner<S, T>>,
}

impl<S, T> Clone for OAuthClient<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn pkce_key(state: &str) -> String {
    format!("pkce:{state}")
}

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

#[cfg(feature = "reqwest-client")]
impl<S> OAuthClient<S, reqwest::Client>
where
    S: OAuthStorage + 'static,
{
    pub fn new(config: OAuthClientConfig, storage: S) -> Result<Self> {
        Self::new_with_client(config, storage, reqwest::Client::new())
    }
}

impl<S, T> OAuthClient<S, T>
where
    S: OAuthStorage + 'static,
    T: HttpClient + Clone + Send + Sync + 'static,
{
    pub fn new_with_client(config: OAuthClientConfig, storage: S, http: T) -> Result<Self> {
        if config.client_id.trim().is_empty() {
            return Err(OAuthError::Config("clientId is required".into()));
        }
        if config.redirect_uri.trim().is_empty() {
            return Err(OAuthError::Config("redirectUri is required".into()));
        }
        let plc_directory_url = match config.plc_directory_url {
            Some(url) => url,
            None => Url::parse(DEFAULT_PLC_DIRECTORY_URL)
                .map_err(|e| OAuthError::Config(SmolStr::new(e.to_string())))?,
        };
        let resolver = match config.handle_resolver {
            Some(resolver) => resolver,
            None => {
                let mut resolver = SlingshotResolver::new(http.clone())
                    .with_plc_directory_url(plc_directory_url.clone());
                if let Some(url) = config.slingshot_url {
                    resolver = resolver.with_slingshot_url(url);
                }
                Arc::new(resolver)
            }
        };
        Ok(Self {
            inner: Arc::new(ClientInner {
                client_id: config.client_id,
                redirect_uri: config.redirect_uri,
                scope: config.scope.unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
                refresh_timeout: config.refresh_timeout.unwrap_or(DEFAULT_REFRESH_TIMEOUT),
                plc_directory_url,
                storage,
                http,
                resolver,
                on_session_updated: config.on_session_updated,
                on_session_deleted: config.on_session_deleted,
                request_lock: config.request_lock,
                restore_locks: Mutex::new(HashMap::new()),
                refresh_locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Begin authorization for `input`: a handle, or an HTTPS auth-server URL
    /// when the user knows their server but not their handle. Returns the URL
    /// to send the user to.
    #[tracing::instrument(level = "debug", skip(self, options))]
    pub async fn authorize(&self, input: &str, options: AuthorizeOptions) -> Result<Url> {
        let inner = &self.inner;
        let target = resolver::resolve_oauth(&inner.http, inner.resolver.as_ref(), input).await?;
        let metadata = target.metadata;

        let code_verifier = utils::generate_code_verifier();
        let code_challenge = utils::code_challenge(&code_verifier);
        let state = options.state.unwrap_or_else(utils::generate_state);
        let scope = options
            .scope
            .as_deref()
            .unwrap_or(&inner.scope)
            .to_string();

        let (handle, did) = match &target.identity {
            Some(identity) => (identity.handle.clone(), Some(identity.did.clone())),
            None => (None, None),
        };
        // login_hint only makes sense when the user typed an identity.
        let login_hint = if target.identity.is_some() {
            options
                .login_hint
                .or_else(|| Some(SmolStr::new(input)))
        } else {
            None
        };

        let pkce = PkceState {
            code_verifier,
            auth_server: metadata.issuer.clone(),
            issuer: metadata.issuer.clone(),
            handle,
            did,
            pds_url: target.pds_url,
        };
        inner
            .storage
            .set(
                &pkce_key(&state),
                serde_json::to_value(&pkce).map_err(crate::authstore::StorageError::from)?,
                Some(PKCE_TTL),
            )
            .await?;

        let parameters = ParParameters {
            response_type: ResponseType::Code,
            client_id: &inner.client_id,
            redirect_uri: &inner.redirect_uri,
            scope: &scope,
            state: &state,
            code_challenge: &code_challenge,
            code_challenge_method: CodeChallengeMethod::S256,
            login_hint: login_hint.as_deref(),
            prompt: options.prompt.map(|p| p.as_str()),
        };
        let par_response = request::par(&inner.http, &metadata, parameters).await?;
        tracing::debug!(request_uri = %par_response.request_uri, "pushed authorization request accepted");

        #[derive(Serialize)]
        struct AuthorizeQuery<'a> {
            client_id: &'a str,
            request_uri: &'a str,
        }
        let mut url = metadata.authorization_endpoint.clone();
        let query = serde_html_form::to_string(AuthorizeQuery {
            client_id: &inner.client_id,
            request_uri: &par_response.request_uri,
        })
        .map_err(|e| OAuthError::session("failed to encode authorize URL", Some(SharedError::new(e))))?;
        url.set_query(Some(&query));
        Ok(url)
    }

    /// Handle the redirect back from the authorization server. The PKCE
    /// record is deleted on success and failure alike; a given `state` can be
    /// consumed exactly once.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn callback(&self, params: CallbackParams) -> Result<CallbackResult> {
        if params.response.is_some() {
            return Err(OAuthError::Authorization {
                error: "unsupported_response_mode".into(),
                error_description: Some("JARM responses are not supported".into()),
            });
        }
        if let Some(error) = params.error {
            return Err(OAuthError::Authorization {
                error,
                error_description: params.error_description,
            });
        }
        let Some(code) = params.code else {
            return Err(OAuthError::Authorization {
                error: "invalid_request".into(),
                error_description: Some("missing `code` parameter".into()),
            });
        };
        let Some(state) = params.state else {
            return Err(OAuthError::InvalidState);
        };

        let key = pkce_key(&state);
        let Some(raw) = self.inner.storage.get(&key).await? else {
            return Err(OAuthError::InvalidState);
        };
        let pkce: PkceState = serde_json::from_value(raw).map_err(|e| {
            OAuthError::session("stored authorization state is corrupt", Some(SharedError::new(e)))
        })?;

        let result = self
            .callback_inner(&code, &pkce, params.iss.as_deref())
            .await;
        if let Err(e) = self.inner.storage.del(&key).await {
            tracing::warn!(error = %e, "failed to delete authorization state");
        }
        let session = result?;
        if let Some(on_updated) = &self.inner.on_session_updated {
            on_updated(session.did.as_str(), &session);
        }
        Ok(CallbackResult { session, state })
    }

    async fn callback_inner(
        &self,
        code: &str,
        pkce: &PkceState,
        iss: Option<&str>,
    ) -> Result<Session> {
        let inner = &self.inner;

        // RFC 9207: the issuer identifying itself in the callback must be the
        // one authorization started against.
        if let Some(iss) = iss {
            if iss.trim_end_matches('/') != pkce.issuer.as_str().trim_end_matches('/') {
                return Err(OAuthError::IssuerMismatch {
                    expected: pkce.issuer.to_string(),
                    actual: iss.to_string(),
                    handle: pkce.handle.clone(),
                    did: pkce.did.clone(),
                });
            }
        }

        let dpop_key = utils::generate_dpop_key();
        let private_jwk = utils::private_jwk(&dpop_key);
        let public_jwk = utils::public_jwk(&dpop_key)?;

        let metadata = resolver::fetch_auth_server_metadata(&inner.http, &pkce.auth_server).await?;
        let tokens = request::exchange_code(
            &inner.http,
            &metadata,
            &private_jwk,
            &inner.client_id,
            &inner.redirect_uri,
            code,
            &pkce.code_verifier,
        )
        .await?;
        // The validated `sub` is the authoritative DID for this session.
        let did = tokens.sub.clone();

        let mut handle = pkce.handle.clone();
        let mut pds_url = pkce.pds_url.clone();

        // Re-discover the issuer that actually governs this DID and require
        // it to be the server we authorized against. Without this step a
        // hostile authorization server could mint tokens for an identity it
        // does not control. Discovery failures that are not mismatches do
        // not block: PKCE still protected the exchange.
        match heddle_identity::resolve_did(&inner.http, &inner.plc_directory_url, &did).await {
            Ok(identity) => {
                match resolver::discover_from_pds(&inner.http, &identity.pds_url).await {
                    Ok(account_metadata) => {
                        if account_metadata.issuer != pkce.issuer {
                            return Err(OAuthError::IssuerMismatch {
                                expected: pkce.issuer.to_string(),
                                actual: account_metadata.issuer.to_string(),
                                handle: identity.handle.clone().or(handle),
                                did: Some(did),
                            });
                        }
                    }
                    Err(e) => {
                        tracing::warn!(did = %did, error = %e, "issuer re-verification discovery failed")
                    }
                }
                if pkce.did.is_none() {
                    // Auth-server-URL flow: the record carried no identity,
                    // so the token's DID supplies both the handle and the
                    // real PDS (the stored URL was only discovery context).
                    handle = identity.handle.clone().or(handle);
                    pds_url = Some(identity.pds_url);
                } else {
                    if handle.is_none() {
                        handle = identity.handle.clone();
                    }
                    if pds_url.is_none() {
                        pds_url = Some(identity.pds_url);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(did = %did, error = %e, "could not resolve identity for token subject")
            }
        }

        let Some(pds_url) = pds_url else {
            return Err(OAuthError::PdsDiscovery {
                url: SmolStr::new(did.as_str()),
                source: None,
            });
        };
        let handle = handle.ok_or_else(|| {
            OAuthError::session("could not determine a handle for the session", None)
        })?;

        Ok(Session::new(
            did, handle, pds_url, &tokens, private_jwk, public_jwk,
        ))
    }

    /// Persist a session under `session:<session_id>`.
    pub async fn store(&self, session_id: &str, session: &Session) -> Result<()> {
        let value = session
            .to_json()
            .map_err(crate::authstore::StorageError::from)?;
        self.inner
            .storage
            .set(&session_key(session_id), value, None)
            .await?;
        Ok(())
    }

    /// Load a session, refreshing it first when it is expired. Concurrent
    /// restores of the same id share one underlying task.
    pub async fn restore(&self, session_id: &str) -> Result<Session> {
        let this = self.clone();
        let sid = session_id.to_string();
        single_flight(&self.inner.restore_locks, session_id, move || {
            async move { this.restore_inner(&sid).await }.boxed()
        })
        .await
    }

    async fn restore_inner(&self, session_id: &str) -> Result<Session> {
        let Some(raw) = self.inner.storage.get(&session_key(session_id)).await? else {
            return Err(OAuthError::SessionNotFound(SmolStr::new(session_id)));
        };
        let mut session = Session::from_json(raw)
            .map_err(|e| OAuthError::session("stored session is corrupt", Some(SharedError::new(e))))?;
        session.set_refresh_hook(self.refresh_hook(session_id));

        if session.is_expired() {
            tracing::debug!(session_id, did = %session.did, "restored session is expired, refreshing");
            let mut refreshed = self
                .refresh_for(session_id, &session)
                .await
                .map_err(classify_restore_failure)?;
            refreshed.set_refresh_hook(self.refresh_hook(session_id));
            self.store(session_id, &refreshed).await?;
            session = refreshed;
        }
        Ok(session)
    }

    /// Refresh a session's tokens. Serialized per DID: through the
    /// configured [`RequestLock`] when one is present, otherwise through the
    /// in-memory single-flight map.
    pub async fn refresh(&self, session: &Session) -> Result<Session> {
        // Standalone refreshes coordinate through the DID-keyed record.
        self.refresh_for(session.did.as_str(), session).await
    }

    async fn refresh_for(&self, session_id: &str, session: &Session) -> Result<Session> {
        if let Some(lock) = &self.inner.request_lock {
            let _guard = lock.acquire(&format!("refresh:{}", session.did)).await;
            return self.refresh_inner(session_id, session).await;
        }
        let this = self.clone();
        let sid = session_id.to_string();
        let snapshot = session.clone();
        single_flight(&self.inner.refresh_locks, session.did.as_str(), move || {
            async move { this.refresh_inner(&sid, &snapshot).await }.boxed()
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self, session), fields(did = %session.did))]
    async fn refresh_inner(&self, session_id: &str, session: &Session) -> Result<Session> {
        let inner = &self.inner;
        let Some(refresh_token) = session.refresh_token.clone() else {
            return Err(OAuthError::session("session has no refresh token", None));
        };

        let metadata = resolver::discover_from_pds(&inner.http, &session.pds_url).await?;
        let outcome = request::refresh_grant(
            &inner.http,
            &metadata.token_endpoint,
            &session.dpop_private_key_jwk,
            &inner.client_id,
            &refresh_token,
            inner.refresh_timeout,
        )
        .await;

        match outcome {
            Ok(tokens) => {
                let mut refreshed = session.clone();
                refreshed.update_tokens(tokens.access_token, tokens.refresh_token, tokens.expires_in);
                if let Some(on_updated) = &inner.on_session_updated {
                    on_updated(session_id, &refreshed);
                }
                Ok(refreshed)
            }
            Err(error) => {
                if error.is_refresh_replay() {
                    // Another refresher spent this token first; its result
                    // lands in storage.
                    tokio::time::sleep(REPLAY_RECOVERY_DELAY).await;
                    if let Ok(Some(raw)) = inner.storage.get(&session_key(session_id)).await {
                        if let Ok(stored) = Session::from_json(raw) {
                            if !stored.is_expired() {
                                tracing::debug!(session_id, "recovered replayed refresh from storage");
                                return Ok(stored);
                            }
                        }
                    }
                }
                let classified = error.classify_refresh();
                if matches!(
                    classified,
                    OAuthError::RefreshTokenExpired | OAuthError::RefreshTokenRevoked
                ) {
                    self.spawn_revocation(
                        metadata.revocation_endpoint.clone(),
                        session.dpop_private_key_jwk.clone(),
                        refresh_token,
                    );
                }
                Err(classified)
            }
        }
    }

    /// Best-effort, fire-and-forget revocation of a dead refresh token.
    fn spawn_revocation(&self, endpoint: Option<Url>, dpop_jwk: Jwk, token: SmolStr) {
        let Some(endpoint) = endpoint else { return };
        let http = self.inner.http.clone();
        let client_id = self.inner.client_id.clone();
        tokio::spawn(async move {
            if let Err(e) = request::revoke(&http, &endpoint, &dpop_jwk, &client_id, &token).await {
                tracing::debug!(error = %e, "best-effort token revocation failed");
            }
        });
    }

    /// Revoke the refresh token (best effort) and delete the stored session.
    /// The stored record is removed and `on_session_deleted` fires regardless
    /// of the revocation outcome.
    #[tracing::instrument(level = "debug", skip(self, session))]
    pub async fn sign_out(&self, session_id: &str, session: &Session) -> Result<()> {
        if let Some(refresh_token) = &session.refresh_token {
            match resolver::discover_from_pds(&self.inner.http, &session.pds_url).await {
                Ok(metadata) => {
                    if let Some(endpoint) = metadata.revocation_endpoint {
                        if let Err(e) = request::revoke(
                            &self.inner.http,
                            &endpoint,
                            &session.dpop_private_key_jwk,
                            &self.inner.client_id,
                            refresh_token,
                        )
                        .await
                        {
                            tracing::debug!(error = %e, "sign-out revocation failed");
                        }
                    }
                }
                Err(e) => tracing::debug!(error = %e, "sign-out discovery failed"),
            }
        }
        let deleted = self.inner.storage.del(&session_key(session_id)).await;
        if let Some(on_deleted) = &self.inner.on_session_deleted {
            on_deleted(session_id);
        }
        deleted.map_err(Into::into)
    }

    fn refresh_hook(&self, session_id: &str) -> crate::session::RefreshHook {
        let client = self.clone();
        let session_id = session_id.to_string();
        Arc::new(move |session: Session| {
            let client = client.clone();
            let session_id = session_id.clone();
            async move {
                let refreshed = client.refresh_for(&session_id, &session).await?;
                client.store(&session_id, &refreshed).await?;
                Ok(refreshed)
            }
            .boxed()
        })
    }
}

/// Deduplicate concurrent tasks per key: the first caller installs a shared
/// future, later callers await the same one, and the installer removes the
/// entry once it completes.
async fn single_flight<F>(map: &TaskMap, key: &str, make: F) -> Result<Session>
where
    F: FnOnce() -> BoxFuture<'static, Result<Session>>,
{
    let (task, created) = {
        let mut locks = map.lock().await;
        match locks.get(key) {
            Some(task) => (task.clone(), false),
            None => {
                let task = make().shared();
                locks.insert(key.to_string(), task.clone());
                (task, true)
            }
        }
    };
    let result = task.await;
    if created {
        map.lock().await.remove(key);
    }
    result
}

fn classify_restore_failure(error: OAuthError) -> OAuthError {
    match error {
        passthrough @ (OAuthError::Network { .. }
        | OAuthError::TokenExchange { .. }
        | OAuthError::RefreshTokenExpired
        | OAuthError::RefreshTokenRevoked
        | OAuthError::SessionNotFound(_)
        | OAuthError::Session { .. }
        | OAuthError::Storage(..)) => passthrough,
        other => {
            let message = format!("session restore failed: {other}");
            OAuthError::session(message, Some(SharedError::new(other)))
        }
    }
}
