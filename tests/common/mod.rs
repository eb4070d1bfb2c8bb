//! Shared test fixtures: a proxy wired to a temp-dir store and a mock
//! upstream registry that records every request it serves.

// Each integration test binary compiles this module and uses a subset.
#![allow(dead_code)]

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Router;
use axum_test::TestServer;
use ollama_lancache::{AppState, Config, ModelStore, UpstreamClient};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Canned response the mock upstream returns for one exact path.
#[derive(Clone)]
pub struct MockResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl MockResponse {
    pub fn ok(content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type,
            body: body.into(),
        }
    }
}

/// A live HTTP server standing in for the real registry. Counts hits per
/// path so tests can assert how often the proxy actually went upstream.
#[derive(Clone, Default)]
pub struct MockUpstream {
    responses: Arc<Mutex<HashMap<String, MockResponse>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockUpstream {
    pub async fn start() -> (Self, SocketAddr) {
        let mock = Self::default();
        let app = Router::new()
            .fallback(mock_handler)
            .with_state(mock.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let addr = listener.local_addr().expect("mock upstream addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (mock, addr)
    }

    pub fn stub(&self, path: &str, response: MockResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert(path.to_string(), response);
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

async fn mock_handler(State(mock): State<MockUpstream>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    *mock.hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

    let stubbed = mock.responses.lock().unwrap().get(&path).cloned();
    match stubbed {
        Some(stub) => {
            let mut response = Response::new(Body::from(stub.body));
            *response.status_mut() = stub.status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(stub.content_type),
            );
            response
        }
        None => {
            let mut response = Response::new(Body::from("mock upstream: no stub"));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

pub struct TestSetup {
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub upstream: MockUpstream,
    _cache_dir: TempDir,
}

/// Proxy under test, backed by a fresh temp store and the mock upstream.
pub async fn create_test_setup() -> TestSetup {
    let (upstream, upstream_addr) = MockUpstream::start().await;
    let (state, cache_dir) = create_app_state(upstream_addr).await;
    let app = ollama_lancache::server::build_router(state.clone());
    let server = TestServer::new(app).expect("create test server");
    TestSetup {
        server,
        state,
        upstream,
        _cache_dir: cache_dir,
    }
}

/// Application state pointing at an arbitrary upstream address; used both
/// by the TestServer setup above and by tests that serve on a real socket.
pub async fn create_app_state(upstream_addr: SocketAddr) -> (Arc<AppState>, TempDir) {
    let cache_dir = TempDir::new().expect("create temp cache dir");
    let store = Arc::new(ModelStore::new(cache_dir.path()).expect("create store"));

    let config = Arc::new(Config {
        cache_dir: cache_dir.path().to_path_buf(),
        registry_host: "registry.ollama.ai".to_string(),
        upstream_url: format!("http://{upstream_addr}"),
        control_timeout_secs: 5,
        ..Config::default()
    });
    let upstream_client = Arc::new(
        UpstreamClient::new(config.upstream_url(), config.control_timeout())
            .expect("create upstream client"),
    );

    let state = Arc::new(AppState::new(store, config, upstream_client));
    (state, cache_dir)
}

/// Wait until `predicate` turns true or the deadline passes. Cache writes
/// finish asynchronously after the client response completes, so tests
/// poll instead of sleeping a fixed amount.
pub async fn wait_for(mut predicate: impl FnMut() -> bool, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

/// A manifest body shaped like the real upstream's responses.
pub fn sample_manifest_body() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": "sha256:aab1c59f38b9c8dd7ede8cf1b345ca60f93e07fead83d4bbadfb958f0518786c",
            "size": 559
        },
        "layers": [
            {
                "mediaType": "application/vnd.ollama.image.model",
                "digest": "sha256:bb77bd8ec4a35eed9d29b1e0b2523e912e14ca40298a5c33d48968e6fcee67ba",
                "size": 4590894944u64
            }
        ]
    }))
    .expect("serialize sample manifest")
}
