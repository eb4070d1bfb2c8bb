//! Docker Registry v2 caching handlers.
//!
//! The proxy recognizes the manifest and blob endpoints of the Registry v2
//! protocol, serves hits from the [`ModelStore`](crate::store::ModelStore),
//! and streams misses from the real upstream while persisting them. Every
//! path it does not recognize is forwarded to the upstream unchanged, so
//! clients probing unrelated endpoints keep working.
//!
//! Blob misses are teed: one pump task reads the upstream body once and
//! feeds two bounded channels, the client response and the cache writer.
//! Back-pressure flows through the bounded channels, so a multi-gigabyte
//! transfer never buffers more than a few chunks in memory. A client that
//! disconnects detaches only its channel; the cache write runs to EOF so
//! the download still populates the cache for the next client.

use crate::error::{AppError, AppResult};
use crate::range::{self, RangeOutcome};
use crate::state::AppState;
use crate::types::{CacheStats, Digest, ManifestKey};
use crate::upstream::{filter_forward_headers, STREAM_IDLE_TIMEOUT};
use axum::{
    body::Body,
    extract::{Path as AxumPath, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, warn};

/// Header every Registry v2 response family carries.
pub const API_VERSION_HEADER: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");
pub const API_VERSION_VALUE: &str = "registry/2.0";

/// Digest header clients validate fetched content against.
pub const CONTENT_DIGEST_HEADER: HeaderName = HeaderName::from_static("docker-content-digest");

/// Bounded depth of each tee channel, in chunks.
const TEE_CHANNEL_DEPTH: usize = 16;

/// Read size for streaming cached blobs back to clients.
const READ_BUF_SIZE: usize = 64 * 1024;

/// `GET /v2/` — the probe Registry v2 clients use to confirm the endpoint
/// speaks their protocol. Answered locally for every method, like the real
/// registry does.
pub async fn registry_root() -> Response {
    let mut response = Response::new(Body::from("{}"));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
        .headers_mut()
        .insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION_VALUE));
    response
}

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "time": Utc::now().to_rfc3339(),
    }))
}

/// `GET /cache/stats`
pub async fn cache_stats(State(state): State<Arc<AppState>>) -> AppResult<Json<CacheStats>> {
    Ok(Json(state.store.stats()?))
}

/// `/v2/{namespace}/{repo}/manifests/{reference}` for every method.
///
/// GET and HEAD are served from the cache when possible; a GET miss is
/// fetched upstream and cached on success. Everything else (pushes,
/// deletes) passes through untouched.
pub async fn manifest(
    State(state): State<Arc<AppState>>,
    AxumPath((namespace, repo, reference)): AxumPath<(String, String, String)>,
    req: Request,
) -> Response {
    let key = ManifestKey::new(state.config.registry_host.as_str(), namespace, repo, reference);
    let method = req.method().clone();

    if (method == Method::GET || method == Method::HEAD) && state.store.has_manifest(&key) {
        match state.store.get_manifest(&key).await {
            Ok(stored) => {
                info!(key = %key, "Manifest cache hit");
                return manifest_hit_response(&method, stored);
            }
            Err(e) => {
                // A corrupt entry reads as a miss; the re-fetch overwrites it.
                warn!(key = %key, error = %e, "Cached manifest unreadable, falling back to upstream");
            }
        }
    }

    if method == Method::GET {
        fetch_and_cache_manifest(state, key, req).await
    } else {
        passthrough_request(state, req).await
    }
}

fn manifest_hit_response(method: &Method, stored: crate::store::StoredManifest) -> Response {
    let mut response = Response::new(if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(stored.raw.clone())
    });
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(stored.manifest.media_type()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(stored.digest.as_str()) {
        headers.insert(CONTENT_DIGEST_HEADER, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(stored.raw.len()));
    headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION_VALUE));
    response
}

async fn fetch_and_cache_manifest(
    state: Arc<AppState>,
    key: ManifestKey,
    req: Request,
) -> Response {
    info!(key = %key, "Manifest cache miss, fetching upstream");

    let request = state.upstream.mirror_request(
        req.method(),
        path_and_query(req.uri()),
        req.headers(),
    );
    let upstream_response = match state.upstream.send_control(request).await {
        Ok(response) => response,
        Err(e) => return e.into_response(),
    };

    let status = upstream_response.status();
    let headers = filter_forward_headers(upstream_response.headers());
    let body = match upstream_response.bytes().await {
        Ok(body) => body,
        Err(e) => return AppError::Upstream(e.to_string()).into_response(),
    };

    if status == StatusCode::OK {
        match state.store.store_manifest(&key, &body).await {
            Ok(()) => info!(key = %key, "Cached manifest"),
            // An unparseable body is still returned to the client verbatim.
            Err(e) => warn!(key = %key, error = %e, "Manifest not cached"),
        }
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// `/v2/{namespace}/{repo}/blobs/{digest}` for every method.
///
/// Only `sha256:` plus 64 lowercase hex characters names a blob; anything
/// else in that path position is not a blob request and passes through.
pub async fn blob(
    State(state): State<Arc<AppState>>,
    AxumPath((_namespace, _repo, digest_param)): AxumPath<(String, String, String)>,
    req: Request,
) -> Response {
    let Some(digest) = Digest::parse(&digest_param) else {
        debug!(reference = %digest_param, "Not a blob digest, passing through");
        return passthrough_request(state, req).await;
    };
    let method = req.method().clone();

    if (method == Method::GET || method == Method::HEAD) && state.store.has_blob(&digest) {
        info!(digest = %digest, method = %method, "Blob cache hit");
        return serve_cached_blob(&state, &digest, &method, req.headers()).await;
    }

    if method == Method::GET {
        fetch_and_cache_blob(state, digest, req).await
    } else {
        passthrough_request(state, req).await
    }
}

/// Serve a committed blob, honoring `Range`, `If-Range`, and
/// `If-None-Match` exactly like the real registry.
async fn serve_cached_blob(
    state: &AppState,
    digest: &Digest,
    method: &Method,
    request_headers: &HeaderMap,
) -> Response {
    let Some(size) = state.store.blob_size(digest) else {
        // The blob vanished between the existence check and here.
        return AppError::NotFound(format!("blob not cached: {digest}")).into_response();
    };
    let etag = digest.etag();

    let (status, start, len, content_range) =
        match range::evaluate(request_headers, size, &etag) {
            RangeOutcome::NotModified => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::NOT_MODIFIED;
                set_blob_headers(response.headers_mut(), digest, &etag);
                return response;
            }
            RangeOutcome::Unsatisfiable => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                if let Ok(value) = HeaderValue::from_str(&range::unsatisfiable_content_range(size))
                {
                    response.headers_mut().insert(header::CONTENT_RANGE, value);
                }
                return response;
            }
            RangeOutcome::Full => (StatusCode::OK, 0, size, None),
            RangeOutcome::Partial { start, end } => (
                StatusCode::PARTIAL_CONTENT,
                start,
                end - start + 1,
                Some(range::content_range(start, end, size)),
            ),
        };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    set_blob_headers(headers, digest, &etag);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if let Some(content_range) = content_range {
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }

    if method == Method::HEAD {
        return response;
    }

    let (mut file, _size) = match state.store.get_blob(digest).await {
        Ok(opened) => opened,
        Err(e) => return e.into_response(),
    };
    if start > 0 {
        if let Err(e) = file.seek(io::SeekFrom::Start(start)).await {
            return AppError::Io(e).into_response();
        }
    }
    let stream = ReaderStream::with_capacity(file.take(len), READ_BUF_SIZE);
    *response.body_mut() = Body::from_stream(stream);
    response
}

fn set_blob_headers(headers: &mut HeaderMap, digest: &Digest, etag: &str) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(digest.as_str()) {
        headers.insert(CONTENT_DIGEST_HEADER, value);
    }
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(value) = HeaderValue::from_str(etag) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );
    headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION_VALUE));
}

/// Blob miss: fetch upstream, stream to the client, and tee the body into
/// the store. The store write survives a client disconnect; a digest
/// mismatch discards the staging file and the client keeps whatever the
/// upstream sent.
async fn fetch_and_cache_blob(state: Arc<AppState>, digest: Digest, req: Request) -> Response {
    info!(digest = %digest, "Blob cache miss, fetching upstream");

    let request = state.upstream.mirror_request(
        req.method(),
        path_and_query(req.uri()),
        req.headers(),
    );
    let upstream_response = match state.upstream.send_streaming(request).await {
        Ok(response) => response,
        Err(e) => return e.into_response(),
    };

    let status = upstream_response.status();
    if status != StatusCode::OK {
        debug!(digest = %digest, status = %status, "Upstream blob response not cacheable");
        return mirror_streaming_response(upstream_response);
    }

    let mut headers = filter_forward_headers(upstream_response.headers());
    // The body passes through unmodified, so the upstream length still holds.
    if let Some(content_length) = upstream_response.content_length() {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
    }

    let (client_tx, client_rx) = mpsc::channel::<Result<Bytes, io::Error>>(TEE_CHANNEL_DEPTH);
    let (store_tx, store_rx) = mpsc::channel::<Result<Bytes, io::Error>>(TEE_CHANNEL_DEPTH);

    let writer_state = state.clone();
    let writer_digest = digest.clone();
    tokio::spawn(async move {
        let reader = StreamReader::new(ReceiverStream::new(store_rx));
        match writer_state.store.store_blob(&writer_digest, reader).await {
            Ok(size) => info!(digest = %writer_digest, size, "Cached blob"),
            Err(e) => warn!(digest = %writer_digest, error = %e, "Blob not cached"),
        }
    });

    tokio::spawn(async move {
        let mut stream = upstream_response.bytes_stream();
        let mut client_open = true;
        let mut store_open = true;
        loop {
            let chunk = match tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    let message = format!("upstream read failed: {e}");
                    fail_tee(&client_tx, &store_tx, client_open, store_open, &message).await;
                    return;
                }
                Ok(None) => break,
                Err(_) => {
                    fail_tee(
                        &client_tx,
                        &store_tx,
                        client_open,
                        store_open,
                        "upstream read idle timeout",
                    )
                    .await;
                    return;
                }
            };
            // Bounded sends give back-pressure in both directions: a slow
            // client stalls the pump, which stalls the store write too.
            if store_open && store_tx.send(Ok(chunk.clone())).await.is_err() {
                store_open = false;
            }
            if client_open && client_tx.send(Ok(chunk)).await.is_err() {
                // Client went away; keep feeding the cache until EOF.
                debug!("Client disconnected mid-transfer, continuing cache write");
                client_open = false;
            }
            if !client_open && !store_open {
                return;
            }
        }
    });

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(client_rx)));
    *response.headers_mut() = headers;
    response
}

async fn fail_tee(
    client_tx: &mpsc::Sender<Result<Bytes, io::Error>>,
    store_tx: &mpsc::Sender<Result<Bytes, io::Error>>,
    client_open: bool,
    store_open: bool,
    message: &str,
) {
    warn!(error = %message, "Aborting blob tee");
    if store_open {
        let _ = store_tx
            .send(Err(io::Error::new(io::ErrorKind::Other, message.to_string())))
            .await;
    }
    if client_open {
        let _ = client_tx
            .send(Err(io::Error::new(io::ErrorKind::Other, message.to_string())))
            .await;
    }
}

/// Transparent pass-through for everything the proxy does not recognize:
/// same method, path, query, headers, and body to the upstream; status,
/// headers, and body mirrored back.
pub async fn passthrough(State(state): State<Arc<AppState>>, req: Request) -> Response {
    passthrough_request(state, req).await
}

async fn passthrough_request(state: Arc<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    debug!(method = %parts.method, path = %parts.uri.path(), "Passing request through");

    let request = state
        .upstream
        .mirror_request(&parts.method, path_and_query(&parts.uri), &parts.headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    match state.upstream.send_control(request).await {
        Ok(response) => mirror_streaming_response(response),
        Err(e) => e.into_response(),
    }
}

fn mirror_streaming_response(upstream_response: reqwest::Response) -> Response {
    let status = upstream_response.status();
    let headers = filter_forward_headers(upstream_response.headers());
    let stream = upstream_response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or(uri.path())
}
