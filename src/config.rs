//! # Configuration Management
//!
//! Runtime configuration for the cache server. Values come from three
//! layers, strongest first: command-line flags, an optional JSON config
//! file, and the built-in defaults below.
//!
//! ```rust,no_run
//! # use ollama_lancache::config::Config;
//! // Load from file with fallback to defaults
//! let config = Config::load_or_default("lancache.json")?;
//! # Ok::<(), ollama_lancache::AppError>(())
//! ```

use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Standard HTTPS port; binding it enables the self-signed TLS shim.
pub const HTTPS_PORT: u16 = 443;

/// Main configuration for the cache server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for the content-addressed store.
    pub cache_dir: PathBuf,
    /// Bind address for both listeners; also the IP advertised in
    /// intercepted DNS answers.
    pub listen_addr: String,
    /// TCP port for the Registry v2 proxy (443 enables TLS).
    pub http_port: u16,
    /// UDP port for the DNS server.
    pub dns_port: u16,
    /// Whether to run the HTTP proxy listener.
    pub http_enabled: bool,
    /// Whether to run the DNS listener.
    pub dns_enabled: bool,
    /// `host:port` of the resolver that receives forwarded queries.
    pub upstream_dns: String,
    /// Hostname to intercept; also the `registry` field of cache keys
    /// and the default upstream HTTP origin.
    pub registry_host: String,
    /// Base URL of the real registry. Empty means derive
    /// `https://<registry_host>`.
    pub upstream_url: String,
    /// Timeout for upstream control requests (manifests, pass-through).
    /// Blob streams are only subject to per-read idle timeouts.
    pub control_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            listen_addr: "0.0.0.0".to_string(),
            http_port: 80,
            dns_port: 53,
            http_enabled: true,
            dns_enabled: true,
            upstream_dns: "8.8.8.8:53".to_string(),
            registry_host: "registry.ollama.ai".to_string(),
            upstream_url: String::new(),
            control_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a JSON file, falling back to defaults when
    /// the file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Base URL of the real upstream registry.
    pub fn upstream_url(&self) -> String {
        if self.upstream_url.is_empty() {
            format!("https://{}", self.registry_host)
        } else {
            self.upstream_url.trim_end_matches('/').to_string()
        }
    }

    /// Timeout applied to upstream control requests.
    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    /// Whether the proxy should terminate TLS with the self-signed cert.
    pub fn tls_enabled(&self) -> bool {
        self.http_port == HTTPS_PORT
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ollama")
        .join("models")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.http_port, 80);
        assert_eq!(config.dns_port, 53);
        assert!(config.http_enabled);
        assert!(config.dns_enabled);
        assert_eq!(config.registry_host, "registry.ollama.ai");
        assert_eq!(config.upstream_dns, "8.8.8.8:53");
        assert!(!config.tls_enabled());
    }

    #[test]
    fn test_upstream_url_derived_from_registry_host() {
        let config = Config::default();
        assert_eq!(config.upstream_url(), "https://registry.ollama.ai");
    }

    #[test]
    fn test_upstream_url_override_trims_trailing_slash() {
        let config = Config {
            upstream_url: "http://127.0.0.1:5000/".to_string(),
            ..Config::default()
        };
        assert_eq!(config.upstream_url(), "http://127.0.0.1:5000");
    }

    #[test]
    fn test_tls_enabled_on_https_port() {
        let config = Config {
            http_port: 443,
            ..Config::default()
        };
        assert!(config.tls_enabled());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lancache.json");
        fs::write(&path, r#"{"http_port": 8080, "dns_enabled": false}"#).unwrap();

        let config = Config::load_or_default(&path).unwrap();
        assert_eq!(config.http_port, 8080);
        assert!(!config.dns_enabled);
        assert_eq!(config.registry_host, "registry.ollama.ai");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/lancache.json").unwrap();
        assert_eq!(config.http_port, 80);
    }
}
