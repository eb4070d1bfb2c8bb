//! Concurrent-miss behavior over real sockets.
//!
//! Ten clients race GETs for the same uncached blob. With no singleflight
//! layer, each racer may trigger its own upstream fetch, but every client
//! must receive the full correct bytes and the store must end up with
//! exactly one committed file for the digest.

use ollama_lancache::types::Digest;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::{create_app_state, wait_for, MockResponse, MockUpstream};

async fn serve_proxy(state: Arc<ollama_lancache::AppState>) -> SocketAddr {
    let app = ollama_lancache::server::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind proxy listener");
    let addr = listener.local_addr().expect("proxy addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_concurrent_misses_converge() {
    let (upstream, upstream_addr) = MockUpstream::start().await;
    let (state, _cache_dir) = create_app_state(upstream_addr).await;
    let proxy_addr = serve_proxy(state.clone()).await;

    let body: Vec<u8> = (0..2_000_000u32).map(|i| (i % 241) as u8).collect();
    let digest = Digest::for_bytes(&body);
    let path = format!("/v2/library/llama3/blobs/{digest}");
    upstream.stub(&path, MockResponse::ok("application/octet-stream", body.clone()));

    let client = reqwest::Client::new();
    let url = format!("http://{proxy_addr}{path}");
    let mut fetches = Vec::new();
    for _ in 0..10 {
        let client = client.clone();
        let url = url.clone();
        fetches.push(tokio::spawn(async move {
            let response = client.get(&url).send().await.expect("request proxy");
            assert_eq!(response.status(), reqwest::StatusCode::OK);
            response.bytes().await.expect("read body")
        }));
    }

    for fetch in fetches {
        let received = fetch.await.expect("client task");
        assert_eq!(received.as_ref(), body.as_slice(), "every client gets the full bytes");
    }

    // All racers hit an empty cache, so the upstream saw between 1 and 10
    // fetches; what matters is that one consistent blob got committed.
    let hits = upstream.hits(&path);
    assert!((1..=10).contains(&hits), "unexpected upstream fetch count {hits}");

    let store = state.store.clone();
    let committed = {
        let digest = digest.clone();
        wait_for(move || store.has_blob(&digest), Duration::from_secs(5)).await
    };
    assert!(committed);

    let (_file, size) = state.store.get_blob(&digest).await.expect("open blob");
    assert_eq!(size, body.len() as u64);

    // Exactly one committed file under the digest, no staging leftovers.
    let blob_dir = state.config.cache_dir.join("blobs");
    let survives_settling = wait_for(
        move || {
            std::fs::read_dir(&blob_dir)
                .map(|entries| entries.count() == 1)
                .unwrap_or(false)
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(survives_settling, "store must settle to a single committed blob file");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hit_and_miss_responses_are_byte_identical() {
    let (upstream, upstream_addr) = MockUpstream::start().await;
    let (state, _cache_dir) = create_app_state(upstream_addr).await;
    let proxy_addr = serve_proxy(state.clone()).await;

    let body: Vec<u8> = (0..500_000u32).map(|i| (i % 199) as u8).collect();
    let digest = Digest::for_bytes(&body);
    let path = format!("/v2/library/llama3/blobs/{digest}");
    upstream.stub(&path, MockResponse::ok("application/octet-stream", body.clone()));

    let client = reqwest::Client::new();
    let url = format!("http://{proxy_addr}{path}");

    let miss = client.get(&url).send().await.unwrap();
    assert_eq!(miss.status(), reqwest::StatusCode::OK);
    let miss_body = miss.bytes().await.unwrap();

    let store = state.store.clone();
    let cached = {
        let digest = digest.clone();
        wait_for(move || store.has_blob(&digest), Duration::from_secs(5)).await
    };
    assert!(cached);

    let hit = client.get(&url).send().await.unwrap();
    assert_eq!(hit.status(), reqwest::StatusCode::OK);
    let hit_body = hit.bytes().await.unwrap();

    assert_eq!(miss_body, hit_body);
    assert_eq!(upstream.hits(&path), 1);
}
