//! HTTP listener setup: routing, TLS shim, and graceful shutdown.
//!
//! The router recognizes exactly the Registry v2 surface the cache
//! implements; every other path falls through to the transparent
//! pass-through so probing clients keep working. Binding the standard
//! HTTPS port serves the startup-generated self-signed certificate.

use crate::error::AppError;
use crate::registry;
use crate::state::AppState;
use crate::tls;
use anyhow::Context;
use axum::routing::{any, get};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// How long in-flight requests get to finish after the shutdown signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Build the proxy router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v2/", any(registry::registry_root))
        .route(
            "/v2/{namespace}/{repo}/manifests/{reference}",
            any(registry::manifest),
        )
        .route(
            "/v2/{namespace}/{repo}/blobs/{digest}",
            any(registry::blob),
        )
        .route("/health", get(registry::health))
        .route("/cache/stats", get(registry::cache_stats))
        .fallback(registry::passthrough)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP (or HTTPS) proxy listener until the shutdown signal trips.
pub async fn run_http(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let config = state.config.clone();
    let addr: SocketAddr = format!("{}:{}", config.listen_addr, config.http_port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.listen_addr, config.http_port
            )
        })?;

    let app = build_router(state);
    let handle = Handle::new();

    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown.changed().await;
        shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    if config.tls_enabled() {
        // Both ring (via reqwest) and aws-lc-rs (via axum-server) are in
        // the dependency tree; rustls refuses to pick one on its own.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let registry_host = config.registry_host.clone();
        let cert = tokio::task::spawn_blocking(move || {
            tls::generate_self_signed(&registry_host, &local_ipv4s())
        })
        .await
        .map_err(|e| AppError::Internal(format!("certificate task failed: {e}")))??;

        let rustls_config = RustlsConfig::from_pem(
            cert.cert_pem.into_bytes(),
            cert.key_pem.into_bytes(),
        )
        .await
        .context("failed to load generated certificate")?;

        info!(addr = %addr, host = %config.registry_host, "HTTPS proxy listening (self-signed certificate)");
        axum_server::bind_rustls(addr, rustls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .with_context(|| format!("HTTPS proxy failed on {addr}"))?;
    } else {
        info!(addr = %addr, "HTTP proxy listening");
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .with_context(|| format!("HTTP proxy failed on {addr}"))?;
    }

    info!("HTTP proxy stopped");
    Ok(())
}

/// Every non-loopback IPv4 address of the host, for the certificate SANs
/// and the startup banner.
pub fn local_ipv4s() -> Vec<Ipv4Addr> {
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };
    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            std::net::IpAddr::V6(_) => None,
        })
        .collect()
}
