//! # Ollama LanCache
//!
//! A LAN-local caching proxy for the Ollama model registry. Many machines on
//! a private network pull large model artifacts through a single mirror, so
//! each artifact is fetched from the public registry at most once and later
//! pulls run at LAN speed.
//!
//! ## Architecture
//!
//! ```text
//! client ──(DNS A query)──► dns::DnsServer ──► answers with the mirror IP
//! client ──(Registry v2)──► registry handlers ──► store::ModelStore
//!                                   │ (cache miss)
//!                                   ▼
//!                         upstream::UpstreamClient ──► registry.ollama.ai
//! ```
//!
//! ## Key Modules
//!
//! - [`store`]: Content-addressed persistent cache of blobs and manifests
//! - [`registry`]: Docker Registry v2 caching handlers
//! - [`dns`]: UDP resolver that intercepts the registry hostname
//! - [`upstream`]: HTTP client for the real upstream registry
//! - [`server`]: Listener setup, TLS shim, graceful shutdown
//! - [`config`]: Runtime configuration and defaults
//! - [`error`]: Error taxonomy and standardized responses

pub mod cli;
pub mod config;
pub mod dns;
pub mod error;
pub mod range;
pub mod registry;
pub mod server;
pub mod state;
pub mod store;
pub mod tls;
pub mod types;
pub mod upstream;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use state::AppState;
pub use store::ModelStore;
pub use types::{CacheStats, Digest, Manifest, ManifestKey};
pub use upstream::UpstreamClient;

/// Calculate the SHA256 hash of in-memory data as a lowercase hex string.
///
/// Streaming writes hash incrementally instead (see [`store::ModelStore`]);
/// this helper covers the small-payload cases such as manifest bodies.
///
/// # Examples
///
/// ```
/// # use ollama_lancache::sha256_hex;
/// let hash = sha256_hex(b"hello world");
/// assert_eq!(hash.len(), 64);
/// ```
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
