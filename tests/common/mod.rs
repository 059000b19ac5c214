//! Common test utilities for E2E tests

#![allow(dead_code)]

pub mod schema_validator;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use serde_json::{Value, json};
use splitter_federation::{AppState, config, data::User, federation::sign_request};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub domain: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Single instance named `splitter-1` with no reachable peers
    pub async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut peers = HashMap::new();
        // Keep the built-in peer off the network
        peers.insert("splitter-2".to_string(), "http://127.0.0.1:9".to_string());
        Self::start("splitter-1", listener, peers).await
    }

    /// One instance plus a scripted peer registered as `splitter-2`
    pub async fn with_stub() -> (Self, StubInstance) {
        let stub = StubInstance::spawn("splitter-2").await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Self::start(
            "splitter-1",
            listener,
            HashMap::from([("splitter-2".to_string(), stub.base_url.clone())]),
        )
        .await;
        (server, stub)
    }

    /// Two instances, `splitter-1` and `splitter-2`, that know each other
    pub async fn pair() -> (Self, Self) {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let first_url = format!("http://{}", first.local_addr().unwrap());
        let second_url = format!("http://{}", second.local_addr().unwrap());

        let alpha = Self::start(
            "splitter-1",
            first,
            HashMap::from([("splitter-2".to_string(), second_url)]),
        )
        .await;
        let beta = Self::start(
            "splitter-2",
            second,
            HashMap::from([("splitter-1".to_string(), first_url)]),
        )
        .await;
        (alpha, beta)
    }

    async fn start(domain: &str, listener: TcpListener, peers: HashMap<String, String>) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        // Create test configuration
        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: domain.to_string(),
                protocol: "http".to_string(),
                public_url: Some(addr_str.clone()),
            },
            database: config::DatabaseConfig { path: db_path },
            federation: config::FederationConfig {
                key_bits: 1024,
                delivery_timeout_seconds: 5,
                fetch_timeout_seconds: 5,
                known_instances: peers,
                ..config::FederationConfig::default()
            },
            admin: config::AdminConfig {
                api_token: ADMIN_TOKEN.to_string(),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let app = splitter_federation::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: addr_str,
            domain: domain.to_string(),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Actor URI of a local user
    pub fn actor(&self, username: &str) -> String {
        self.url(&format!("/ap/users/{}", username))
    }

    /// `username@domain` handle of a local user
    pub fn handle(&self, username: &str) -> String {
        format!("{}@{}", username, self.domain)
    }

    /// Create a local user in the database
    pub async fn create_user(&self, username: &str) -> User {
        self.state
            .db
            .create_local_user(username, &format!("{} display", username), &self.domain)
            .await
            .unwrap()
    }

    /// GET with the admin bearer token
    pub fn admin_get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(ADMIN_TOKEN)
    }

    /// POST JSON with the admin bearer token
    pub fn admin_post(&self, path: &str, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .bearer_auth(ADMIN_TOKEN)
            .json(body)
    }
}

/// Delivery captured by a [`StubInstance`]
#[derive(Debug, Clone)]
pub struct Received {
    pub path: String,
    pub signed: bool,
    pub body: Value,
}

#[derive(Clone)]
struct StubState {
    domain: String,
    base_url: String,
    public_key_pem: String,
    webfinger_hits: Arc<AtomicUsize>,
    actor_hits: Arc<AtomicUsize>,
    inbox_status: Arc<AtomicU16>,
    received: Arc<Mutex<Vec<Received>>>,
}

/// Minimal remote instance: WebFinger, actor documents and recording inboxes
///
/// Every `/ap/users/{name}` exists and is signed for by the stub's own key.
pub struct StubInstance {
    pub domain: String,
    pub base_url: String,
    pub private_key: RsaPrivateKey,
    state: StubState,
}

impl StubInstance {
    pub async fn spawn(domain: &str) -> Self {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public_key_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let state = StubState {
            domain: domain.to_string(),
            base_url: base_url.clone(),
            public_key_pem,
            webfinger_hits: Arc::new(AtomicUsize::new(0)),
            actor_hits: Arc::new(AtomicUsize::new(0)),
            inbox_status: Arc::new(AtomicU16::new(202)),
            received: Arc::new(Mutex::new(Vec::new())),
        };

        let app = Router::new()
            .route("/.well-known/webfinger", get(stub_webfinger))
            .route("/ap/users/:username", get(stub_actor))
            .route("/ap/users/:username/inbox", post(stub_inbox))
            .route("/ap/shared-inbox", post(stub_inbox))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            domain: domain.to_string(),
            base_url,
            private_key,
            state,
        }
    }

    pub fn actor(&self, username: &str) -> String {
        format!("{}/ap/users/{}", self.base_url, username)
    }

    pub fn handle(&self, username: &str) -> String {
        format!("{}@{}", username, self.domain)
    }

    pub fn shared_inbox(&self) -> String {
        format!("{}/ap/shared-inbox", self.base_url)
    }

    pub fn webfinger_hits(&self) -> usize {
        self.state.webfinger_hits.load(Ordering::SeqCst)
    }

    pub fn actor_hits(&self) -> usize {
        self.state.actor_hits.load(Ordering::SeqCst)
    }

    /// Status code every inbox answers with from now on
    pub fn set_inbox_status(&self, status: u16) {
        self.state.inbox_status.store(status, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().unwrap().clone()
    }

    /// First captured delivery matching `predicate`, waiting up to five seconds
    pub async fn wait_for(&self, predicate: impl Fn(&Received) -> bool) -> Option<Received> {
        for _ in 0..100 {
            if let Some(found) = self.received().into_iter().find(|r| predicate(r)) {
                return Some(found);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    /// POST `activity` to `inbox_url`, signed as the activity's actor
    pub async fn send_signed(&self, inbox_url: &str, activity: &Value) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        let actor = activity["actor"].as_str().unwrap();
        let headers = sign_request(
            "POST",
            inbox_url,
            Some(&body),
            &self.private_key,
            &format!("{}#main-key", actor),
        )
        .unwrap();

        let mut request = reqwest::Client::new()
            .post(inbox_url)
            .header("Content-Type", "application/activity+json")
            .header("Date", headers.date)
            .header("Signature", headers.signature);
        if let Some(digest) = headers.digest {
            request = request.header("Digest", digest);
        }
        request.body(body).send().await.unwrap()
    }
}

async fn stub_webfinger(
    State(state): State<StubState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    state.webfinger_hits.fetch_add(1, Ordering::SeqCst);
    let resource = query.get("resource").ok_or(StatusCode::BAD_REQUEST)?;
    let username = resource
        .trim_start_matches("acct:")
        .strip_suffix(&format!("@{}", state.domain))
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(json!({
        "subject": resource,
        "links": [{
            "rel": "self",
            "type": "application/activity+json",
            "href": format!("{}/ap/users/{}", state.base_url, username),
        }]
    })))
}

async fn stub_actor(State(state): State<StubState>, Path(username): Path<String>) -> Json<Value> {
    state.actor_hits.fetch_add(1, Ordering::SeqCst);
    let id = format!("{}/ap/users/{}", state.base_url, username);
    Json(json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": id,
        "type": "Person",
        "preferredUsername": username,
        "name": format!("{} (stub)", username),
        "inbox": format!("{}/inbox", id),
        "outbox": format!("{}/outbox", id),
        "endpoints": { "sharedInbox": format!("{}/ap/shared-inbox", state.base_url) },
        "publicKey": {
            "id": format!("{}#main-key", id),
            "owner": id,
            "publicKeyPem": state.public_key_pem,
        }
    }))
}

async fn stub_inbox(
    State(state): State<StubState>,
    uri: axum::http::Uri,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> StatusCode {
    state.received.lock().unwrap().push(Received {
        path: uri.path().to_string(),
        signed: headers.contains_key("signature") && headers.contains_key("digest"),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    });
    StatusCode::from_u16(state.inbox_status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Poll `check` until it returns true or five seconds pass
///
/// `check` must own what it reads; clone handles into a `move` closure.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
