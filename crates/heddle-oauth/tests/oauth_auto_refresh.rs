use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::future::join_all;
use heddle_common::{Did, Handle, HttpClient};
use heddle_oauth::client::{OAuthClient, OAuthClientConfig};
use heddle_oauth::error::OAuthError;
use heddle_oauth::session::Session;
use heddle_oauth::types::ValidatedTokens;
use heddle_oauth::utils::{generate_dpop_key, private_jwk, public_jwk};
use heddle_oauth::MemoryAuthStore;
use http::{HeaderValue, Response as HttpResponse, StatusCode};
use serde_json::json;
use tokio::sync::Mutex;
use url::Url;

/// Queued-response HTTP client with a request log. The small per-request
/// delay keeps concurrent callers in flight long enough to observe the
/// single-flight maps.
#[derive(Clone, Default)]
struct MockClient {
    queue: Arc<Mutex<VecDeque<http::Response<Vec<u8>>>>>,
    log: Arc<Mutex<Vec<http::Request<Vec<u8>>>>>,
}

impl MockClient {
    async fn push(&self, resp: http::Response<Vec<u8>>) {
        self.queue.lock().await.push_back(resp);
    }

    async fn count_requests_to(&self, suffix: &str) -> usize {
        self.log
            .lock()
            .await
            .iter()
            .filter(|r| r.uri().path().ends_with(suffix))
            .count()
    }
}

impl HttpClient for MockClient {
    type Error = std::convert::Infallible;
    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = Result<http::Response<Vec<u8>>, Self::Error>> + Send {
        let queue = self.queue.clone();
        let log = self.log.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            log.lock().await.push(request);
            Ok(queue.lock().await.pop_front().expect("no queued response"))
        }
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> http::Response<Vec<u8>> {
    HttpResponse::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(&body).unwrap())
        .unwrap()
}

fn protected_resource(issuer: &str) -> http::Response<Vec<u8>> {
    json_response(StatusCode::OK, json!({ "authorization_servers": [issuer] }))
}

fn auth_server_metadata(issuer: &str) -> http::Response<Vec<u8>> {
    json_response(
        StatusCode::OK,
        json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/oauth/authorize"),
            "token_endpoint": format!("{issuer}/oauth/token"),
            "pushed_authorization_request_endpoint": format!("{issuer}/oauth/par"),
            "dpop_signing_alg_values_supported": ["ES256"]
        }),
    )
}

fn refresh_ok(access_token: &str) -> http::Response<Vec<u8>> {
    json_response(
        StatusCode::OK,
        json!({
            "access_token": access_token,
            "token_type": "DPoP",
            "scope": "atproto transition:generic",
            "sub": "did:plc:alice123",
            "expires_in": 3600,
            "refresh_token": "rt-2"
        }),
    )
}

fn session_with_expiry(pds: &str, expires_in: i64) -> Session {
    let key = generate_dpop_key();
    Session::new(
        Did::new("did:plc:alice123").unwrap(),
        Handle::new("alice.example.net").unwrap(),
        Url::parse(pds).unwrap(),
        &ValidatedTokens {
            access_token: "at-1".into(),
            refresh_token: Some("rt-1".into()),
            scope: "atproto transition:generic".into(),
            sub: Did::new("did:plc:alice123").unwrap(),
            expires_in,
        },
        private_jwk(&key),
        public_jwk(&key).unwrap(),
    )
}

fn config() -> OAuthClientConfig {
    OAuthClientConfig::new(
        "https://app.example.com/client-metadata.json",
        "https://app.example.com/oauth/callback",
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn resource_401_triggers_refresh_and_final_retry() {
    let issuer = "https://issuer.auto-test.example.com";
    let pds = "https://pds.auto-test.example.com";
    let mock = MockClient::default();
    let store = MemoryAuthStore::new();
    let client = OAuthClient::new_with_client(config(), store.clone(), mock.clone()).unwrap();

    let session = session_with_expiry(pds, 3600);
    client.store("sid-1", &session).await.unwrap();

    // Resource 401 without a nonce header, so the DPoP layer does not retry;
    // then the refresh discovery + grant; then the retried resource call.
    mock.push(
        HttpResponse::builder()
            .status(StatusCode::UNAUTHORIZED)
            .body(Vec::new())
            .unwrap(),
    )
    .await;
    mock.push(protected_resource(issuer)).await;
    mock.push(auth_server_metadata(issuer)).await;
    mock.push(refresh_ok("at-2")).await;
    mock.push(json_response(StatusCode::OK, json!({ "ok": true }))).await;

    let mut restored = client.restore("sid-1").await.unwrap();
    let url = Url::parse(&format!("{pds}/xrpc/com.atproto.server.getSession")).unwrap();
    let response = restored
        .make_request(&mock, http::Method::GET, &url, None, None)
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(restored.access_token, "at-2");
    assert_eq!(restored.refresh_token.as_deref(), Some("rt-2"));

    let log = mock.log.lock().await;
    assert_eq!(log.len(), 5);
    // First resource call used the old token, the final retry the new one.
    let auth = |i: usize| {
        log[i]
            .headers()
            .get(http::header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    };
    assert_eq!(auth(0), "DPoP at-1");
    assert_eq!(auth(4), "DPoP at-2");
    // Resource proofs carry the access-token hash.
    let proof = log[0].headers().get("DPoP").unwrap().to_str().unwrap();
    let payload: serde_json::Value =
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(proof.split('.').nth(1).unwrap()).unwrap())
            .unwrap();
    assert!(payload.get("ath").is_some());
    drop(log);

    // The refreshed tokens were persisted under the restored id.
    let stored = Session::from_json(
        heddle_oauth::OAuthStorage::get(&store, "session:sid-1")
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(stored.access_token, "at-2");
}

#[tokio::test(flavor = "multi_thread")]
async fn refresh_retries_once_on_nonce_challenge() {
    let issuer = "https://issuer.nonce-test.example.com";
    let pds = "https://pds.nonce-test.example.com";
    let mock = MockClient::default();
    let client =
        OAuthClient::new_with_client(config(), MemoryAuthStore::new(), mock.clone()).unwrap();

    mock.push(protected_resource(issuer)).await;
    mock.push(auth_server_metadata(issuer)).await;
    mock.push(
        HttpResponse::builder()
            .status(StatusCode::BAD_REQUEST)
            .header("DPoP-Nonce", HeaderValue::from_static("nonce-1"))
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(&json!({ "error": "use_dpop_nonce" })).unwrap())
            .unwrap(),
    )
    .await;
    mock.push(refresh_ok("at-2")).await;

    let session = session_with_expiry(pds, 3600);
    let refreshed = client.refresh(&session).await.unwrap();
    assert_eq!(refreshed.access_token, "at-2");

    let log = mock.log.lock().await;
    assert_eq!(log.len(), 4);
    assert_eq!(mock_count(&log, "/oauth/token"), 2);
    // The retried proof carries the server's nonce.
    let proof = log[3].headers().get("DPoP").unwrap().to_str().unwrap();
    let payload: serde_json::Value =
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(proof.split('.').nth(1).unwrap()).unwrap())
            .unwrap();
    assert_eq!(payload["nonce"], "nonce-1");
}

fn mock_count(log: &[http::Request<Vec<u8>>], suffix: &str) -> usize {
    log.iter()
        .filter(|r| r.uri().path().ends_with(suffix))
        .count()
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_grant_classifies_as_refresh_token_expired() {
    let issuer = "https://issuer.grant-test.example.com";
    let pds = "https://pds.grant-test.example.com";
    let mock = MockClient::default();
    let client =
        OAuthClient::new_with_client(config(), MemoryAuthStore::new(), mock.clone()).unwrap();

    mock.push(protected_resource(issuer)).await;
    mock.push(auth_server_metadata(issuer)).await;
    mock.push(json_response(
        StatusCode::BAD_REQUEST,
        json!({ "error": "invalid_grant", "error_description": "refresh token expired" }),
    ))
    .await;

    let session = session_with_expiry(pds, 3600);
    let err = client.refresh(&session).await.unwrap_err();
    assert!(matches!(err, OAuthError::RefreshTokenExpired));
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_refresh_recovers_from_storage() {
    let issuer = "https://issuer.replay-test.example.com";
    let pds = "https://pds.replay-test.example.com";
    let mock = MockClient::default();
    let store = MemoryAuthStore::new();
    let client = OAuthClient::new_with_client(config(), store.clone(), mock.clone()).unwrap();

    // A concurrent refresher (another process) already succeeded: storage
    // holds a fresh session under the DID-keyed record.
    let mut fresh = session_with_expiry(pds, 3600);
    fresh.access_token = "at-fresh".into();
    client.store("did:plc:alice123", &fresh).await.unwrap();

    mock.push(protected_resource(issuer)).await;
    mock.push(auth_server_metadata(issuer)).await;
    mock.push(json_response(
        StatusCode::BAD_REQUEST,
        json!({ "error": "invalid_grant", "error_description": "refresh token replayed" }),
    ))
    .await;

    let stale = session_with_expiry(pds, 1);
    let recovered = client.refresh(&stale).await.unwrap();
    assert_eq!(recovered.access_token, "at-fresh");
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_restores_share_one_refresh() {
    let issuer = "https://issuer.restore-race.example.com";
    let pds = "https://pds.restore-race.example.com";
    let mock = MockClient::default();
    let store = MemoryAuthStore::new();
    let client = OAuthClient::new_with_client(config(), store.clone(), mock.clone()).unwrap();

    let expired = session_with_expiry(pds, 1);
    client.store("sid-race", &expired).await.unwrap();

    // Exactly one refresh worth of responses: any duplicate hit would drain
    // the queue and panic.
    mock.push(protected_resource(issuer)).await;
    mock.push(auth_server_metadata(issuer)).await;
    mock.push(refresh_ok("at-2")).await;

    let results = join_all((0..5).map(|_| {
        let client = client.clone();
        async move { client.restore("sid-race").await }
    }))
    .await;

    let sessions: Vec<Session> = results.into_iter().map(|r| r.unwrap()).collect();
    assert!(sessions.iter().all(|s| s.access_token == "at-2"));
    assert_eq!(mock.count_requests_to("/oauth/token").await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_refreshes_hit_token_endpoint_once_per_did() {
    let issuer = "https://issuer.refresh-race.example.com";
    let pds = "https://pds.refresh-race.example.com";
    let mock = MockClient::default();
    let client =
        OAuthClient::new_with_client(config(), MemoryAuthStore::new(), mock.clone()).unwrap();

    mock.push(protected_resource(issuer)).await;
    mock.push(auth_server_metadata(issuer)).await;
    mock.push(refresh_ok("at-2")).await;

    let session = session_with_expiry(pds, 1);
    let results = join_all((0..5).map(|_| {
        let client = client.clone();
        let session = session.clone();
        async move { client.refresh(&session).await }
    }))
    .await;

    for result in results {
        assert_eq!(result.unwrap().access_token, "at-2");
    }
    assert_eq!(mock.count_requests_to("/oauth/token").await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn sign_out_deletes_session_despite_revocation_failure() {
    let issuer = "https://issuer.signout-test.example.com";
    let pds = "https://pds.signout-test.example.com";
    let mock = MockClient::default();
    let store = MemoryAuthStore::new();

    let deleted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let mut config = config();
    let deleted_in_cb = deleted.clone();
    config.on_session_deleted = Some(Arc::new(move |session_id| {
        deleted_in_cb
            .try_lock()
            .expect("callback lock")
            .push(session_id.to_string());
    }));
    let client = OAuthClient::new_with_client(config, store.clone(), mock.clone()).unwrap();

    let session = session_with_expiry(pds, 3600);
    client.store("sid-out", &session).await.unwrap();

    mock.push(protected_resource(issuer)).await;
    mock.push(json_response(
        StatusCode::OK,
        json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/oauth/authorize"),
            "token_endpoint": format!("{issuer}/oauth/token"),
            "revocation_endpoint": format!("{issuer}/oauth/revoke"),
            "dpop_signing_alg_values_supported": ["ES256"]
        }),
    ))
    .await;
    // Revocation blows up; sign-out must not care.
    mock.push(
        HttpResponse::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Vec::new())
            .unwrap(),
    )
    .await;

    client.sign_out("sid-out", &session).await.unwrap();

    assert!(
        heddle_oauth::OAuthStorage::get(&store, "session:sid-out")
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(deleted.lock().await.as_slice(), ["sid-out".to_string()]);
}
