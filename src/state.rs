//! Shared application state for the proxy's request handlers.
//!
//! Constructed once at startup and cloned behind an `Arc` into every
//! handler. Neither the handlers nor the DNS task touch the filesystem
//! directly; all cache access goes through the [`ModelStore`] held here.

use crate::config::Config;
use crate::store::ModelStore;
use crate::upstream::UpstreamClient;
use std::sync::Arc;

/// State shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The content-addressed cache.
    pub store: Arc<ModelStore>,
    /// Runtime configuration.
    pub config: Arc<Config>,
    /// Shared HTTP client for the real upstream registry.
    pub upstream: Arc<UpstreamClient>,
}

impl AppState {
    pub fn new(store: Arc<ModelStore>, config: Arc<Config>, upstream: Arc<UpstreamClient>) -> Self {
        Self {
            store,
            config,
            upstream,
        }
    }
}
