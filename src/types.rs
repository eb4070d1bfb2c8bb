//! Core domain types: digests, manifests, cache keys, and statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The only digest algorithm the registry protocol requires.
pub const DIGEST_ALGORITHM: &str = "sha256";

/// Default media type for Registry v2 image manifests.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// A validated content digest of the form `sha256:<64 lowercase hex chars>`.
///
/// The digest doubles as the blob's identity and its integrity check;
/// anything that does not match the required shape is not a digest and is
/// rejected at the boundary, so the rest of the code never revalidates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Parse a digest string, returning `None` unless it is exactly
    /// `sha256:` followed by 64 lowercase hex characters.
    pub fn parse(s: &str) -> Option<Self> {
        let hex = s.strip_prefix("sha256:")?;
        if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    /// Compute the digest of a byte slice.
    pub fn for_bytes(data: &[u8]) -> Self {
        Self(format!("{}:{}", DIGEST_ALGORITHM, crate::sha256_hex(data)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem name for the blob: `:` is reserved on one major OS, so
    /// `sha256:<hex>` maps to `sha256-<hex>`. Injective for valid digests
    /// because the algorithm label never contains `-`.
    pub fn file_name(&self) -> String {
        self.0.replacen(':', "-", 1)
    }

    /// Strong entity tag for conditional requests.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A content descriptor inside a manifest: one blob reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the content.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
}

/// A Registry v2 image manifest describing one tagged model.
///
/// Stored and served verbatim; this structure exists so the proxy can tell
/// a manifest from arbitrary JSON before caching it, and so callers can
/// walk the layer list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version (2 for every manifest the upstream serves today).
    pub schema_version: u32,
    /// Media type; absent in some older upstream responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors, in order.
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Media type to serve the manifest under.
    pub fn media_type(&self) -> &str {
        self.media_type.as_deref().unwrap_or(MANIFEST_MEDIA_TYPE)
    }

    /// Total size of all layers in bytes.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// The tuple that addresses one stored manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestKey {
    /// Registry hostname the manifest belongs to (e.g. `registry.ollama.ai`).
    pub registry: String,
    /// Namespace path segment; `library` for unscoped model names.
    pub namespace: String,
    /// Model name.
    pub repo: String,
    /// Opaque version label.
    pub tag: String,
}

impl ManifestKey {
    pub fn new(
        registry: impl Into<String>,
        namespace: impl Into<String>,
        repo: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            namespace: namespace.into(),
            repo: repo.into(),
            tag: tag.into(),
        }
    }

    /// Human-readable model reference, omitting the implicit `library`
    /// namespace the way the upstream CLI does.
    pub fn model_ref(&self) -> String {
        if self.namespace == "library" {
            format!("{}:{}", self.repo, self.tag)
        } else {
            format!("{}/{}:{}", self.namespace, self.repo, self.tag)
        }
    }
}

impl fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.registry, self.namespace, self.repo, self.tag
        )
    }
}

/// Cache statistics reported by `/cache/stats` and the `cache stats` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of committed blobs.
    pub blob_count: u64,
    /// Number of stored manifests.
    pub manifest_count: u64,
    /// Total size of all blobs in bytes.
    pub total_blob_bytes: u64,
    /// Total size of all blobs in whole mebibytes.
    pub total_blob_mb: u64,
    /// Root directory of the cache.
    pub cache_directory: PathBuf,
    /// Modification time of the newest entry, if the cache is non-empty.
    pub last_updated: Option<DateTime<Utc>>,
}
