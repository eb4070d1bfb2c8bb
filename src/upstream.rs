//! HTTP client for the real upstream registry.
//!
//! One long-lived `reqwest` client is shared across all request workers.
//! Control requests (manifest fetches, pass-through traffic) carry the
//! configured whole-request timeout; blob streams must survive
//! multi-gigabyte transfers and are therefore only guarded by a connect
//! timeout here plus per-read idle timeouts at the consumption site.
//! Upstream requests verify TLS certificates against the platform roots.

use crate::error::{AppError, AppResult};
use axum::http::{header, HeaderMap, Method};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Idle timeout between chunks when consuming an upstream blob stream.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared client for talking to the real registry.
pub struct UpstreamClient {
    client: Client,
    base_url: String,
    control_timeout: Duration,
}

impl UpstreamClient {
    /// Create the client. `base_url` has no trailing slash
    /// (see `Config::upstream_url`).
    pub fn new(base_url: String, control_timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("ollama-lancache/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            control_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a request that mirrors an incoming one: same method, same
    /// path and query, client headers minus the hop-by-hop set.
    pub fn mirror_request(
        &self,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path_and_query);
        debug!(method = %method, url = %url, "Building upstream request");
        self.client
            .request(method.clone(), &url)
            .headers(filter_forward_headers(headers))
    }

    /// Send a control request with the whole-request timeout applied.
    pub async fn send_control(&self, request: reqwest::RequestBuilder) -> AppResult<reqwest::Response> {
        request
            .timeout(self.control_timeout)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Upstream control request failed");
                AppError::Upstream(e.to_string())
            })
    }

    /// Send a request whose response body will be streamed. No
    /// whole-request timeout: a healthy multi-gigabyte transfer may run
    /// far longer than any sane fixed deadline.
    pub async fn send_streaming(
        &self,
        request: reqwest::RequestBuilder,
    ) -> AppResult<reqwest::Response> {
        request.send().await.map_err(|e| {
            warn!(error = %e, "Upstream streaming request failed");
            AppError::Upstream(e.to_string())
        })
    }
}

/// Headers that must not be forwarded in either direction. `host` is set
/// by the client for our address, not the upstream's; the body-framing
/// headers are recomputed by the HTTP stacks on both hops.
const HOP_HEADERS: [header::HeaderName; 4] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// Copy a header map, dropping the hop-by-hop set.
pub fn filter_forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if HOP_HEADERS.iter().any(|h| h == name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_filter_forward_headers_drops_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("mirror.lan"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=0-99"));

        let filtered = filter_forward_headers(&headers);
        assert!(filtered.get(header::HOST).is_none());
        assert!(filtered.get(header::CONTENT_LENGTH).is_none());
        assert!(filtered.get(header::CONNECTION).is_none());
        assert_eq!(
            filtered.get(header::ACCEPT).unwrap(),
            "application/json"
        );
        assert_eq!(filtered.get(header::RANGE).unwrap(), "bytes=0-99");
    }

    #[test]
    fn test_filter_forward_headers_keeps_repeated_values() {
        let mut headers = HeaderMap::new();
        headers.append(header::ACCEPT, HeaderValue::from_static("a/b"));
        headers.append(header::ACCEPT, HeaderValue::from_static("c/d"));

        let filtered = filter_forward_headers(&headers);
        let values: Vec<_> = filtered.get_all(header::ACCEPT).iter().collect();
        assert_eq!(values.len(), 2);
    }
}
