//! Content-addressed persistent cache of blobs and manifests.
//!
//! Layout under one root directory:
//!
//! ```text
//! <root>/blobs/sha256-<hex>                       blob bytes
//! <root>/manifests/<registry>/<ns>/<repo>/<tag>   verbatim manifest JSON
//! ```
//!
//! Every write stages into a uniquely-named temp file in the same directory
//! as its final target and is committed by an atomic rename, so partial
//! writes are never visible under a final name. Blob writes hash while
//! streaming and refuse to commit on digest mismatch. Concurrent writers
//! for the same key each stage privately; the last rename wins.

use crate::error::{AppError, AppResult};
use crate::types::{CacheStats, Digest, Manifest, ManifestKey};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest as _, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Chunk size for streaming blob writes.
const WRITE_BUF_SIZE: usize = 64 * 1024;

/// Suffix for staging files, so in-progress writes are recognizable and
/// never counted as committed entries.
const TEMP_SUFFIX: &str = ".tmp";

/// A manifest as retrieved from the store: the verbatim bytes, the parsed
/// structure, and the real digest of those bytes.
#[derive(Debug, Clone)]
pub struct StoredManifest {
    pub raw: Bytes,
    pub manifest: Manifest,
    pub digest: Digest,
}

/// The content-addressed model cache.
///
/// Owns its root directory exclusively for the process lifetime. All
/// methods take `&self` and are safe to call from any task.
pub struct ModelStore {
    root: PathBuf,
    blobs_dir: PathBuf,
    manifests_dir: PathBuf,
}

impl ModelStore {
    /// Open (creating if necessary) a store rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> AppResult<Self> {
        let root = root.as_ref().to_path_buf();
        let blobs_dir = root.join("blobs");
        let manifests_dir = root.join("manifests");
        fs::create_dir_all(&blobs_dir)?;
        fs::create_dir_all(&manifests_dir)?;
        debug!(root = %root.display(), "Opened model store");
        Ok(Self {
            root,
            blobs_dir,
            manifests_dir,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir.join(digest.file_name())
    }

    fn manifest_path(&self, key: &ManifestKey) -> PathBuf {
        self.manifests_dir
            .join(escape_component(&key.registry))
            .join(escape_component(&key.namespace))
            .join(escape_component(&key.repo))
            .join(escape_component(&key.tag))
    }

    /// Non-blocking existence check for a blob.
    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Size in bytes of a committed blob, if present.
    pub fn blob_size(&self, digest: &Digest) -> Option<u64> {
        fs::metadata(self.blob_path(digest)).ok().map(|m| m.len())
    }

    /// Open a committed blob for reading. Multiple concurrent readers are
    /// fine; a reader never observes a partially-written blob because
    /// staging files live under temp names until the final rename.
    pub async fn get_blob(&self, digest: &Digest) -> AppResult<(tokio::fs::File, u64)> {
        let path = self.blob_path(digest);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(format!("blob not cached: {digest}"))
            } else {
                AppError::Io(e)
            }
        })?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    /// Consume `reader` to EOF, persisting the bytes as the blob for
    /// `digest`. The hash is computed during streaming; on mismatch the
    /// staging file is deleted and the final name is never created.
    ///
    /// Returns the number of bytes written.
    pub async fn store_blob<R>(&self, digest: &Digest, mut reader: R) -> AppResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let tmp = tempfile::Builder::new()
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.blobs_dir)?;
        let mut file = tokio::fs::File::from_std(tmp.reopen()?);

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut buf = vec![0u8; WRITE_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            written += n as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != digest.as_str() {
            // Dropping `tmp` removes the staging file.
            warn!(expected = %digest, actual = %computed, "Refusing to commit blob");
            return Err(AppError::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }

        tmp.persist(self.blob_path(digest))
            .map_err(|e| AppError::Io(e.error))?;
        info!(digest = %digest, size = written, "Committed blob");
        Ok(written)
    }

    /// Non-blocking existence check for a manifest.
    pub fn has_manifest(&self, key: &ManifestKey) -> bool {
        self.manifest_path(key).is_file()
    }

    /// Read a stored manifest. A file that no longer parses is reported as
    /// [`AppError::Corrupt`] and left in place for operator inspection.
    pub async fn get_manifest(&self, key: &ManifestKey) -> AppResult<StoredManifest> {
        let path = self.manifest_path(key);
        let raw = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(format!("manifest not cached: {key}"))
            } else {
                AppError::Io(e)
            }
        })?;
        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| AppError::Corrupt(format!("manifest {key}: {e}")))?;
        let digest = Digest::for_bytes(&raw);
        Ok(StoredManifest {
            raw: Bytes::from(raw),
            manifest,
            digest,
        })
    }

    /// Write a manifest atomically under `key`, overwriting any previous
    /// manifest for the same tag. The bytes are stored verbatim; they must
    /// parse as a manifest, since that is what `get_manifest` hands back.
    pub async fn store_manifest(&self, key: &ManifestKey, raw: &[u8]) -> AppResult<()> {
        validate_key(key)?;
        let _: Manifest = serde_json::from_slice(raw)?;

        let path = self.manifest_path(key);
        let parent = path
            .parent()
            .ok_or_else(|| AppError::Internal(format!("manifest path has no parent: {key}")))?;
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::Builder::new()
            .suffix(TEMP_SUFFIX)
            .tempfile_in(parent)?;
        std::io::Write::write_all(&mut tmp, raw)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| AppError::Io(e.error))?;
        info!(key = %key, size = raw.len(), "Stored manifest");
        Ok(())
    }

    /// Cache statistics across both namespaces.
    pub fn stats(&self) -> AppResult<CacheStats> {
        let mut blob_count = 0u64;
        let mut total_blob_bytes = 0u64;
        let mut last_updated: Option<DateTime<Utc>> = None;

        for entry in fs::read_dir(&self.blobs_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Staging files carry the temp suffix; only count committed blobs.
            if !name.starts_with("sha256-") || name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            blob_count += 1;
            total_blob_bytes += meta.len();
            update_newest(&mut last_updated, &meta);
        }

        let mut manifest_count = 0u64;
        visit_files(&self.manifests_dir, &mut |_path, meta| {
            manifest_count += 1;
            update_newest(&mut last_updated, meta);
        })?;

        Ok(CacheStats {
            blob_count,
            manifest_count,
            total_blob_bytes,
            total_blob_mb: total_blob_bytes / (1024 * 1024),
            cache_directory: self.root.clone(),
            last_updated,
        })
    }

    /// All manifest keys currently stored, in directory order.
    pub fn manifest_keys(&self) -> AppResult<Vec<ManifestKey>> {
        let mut keys = Vec::new();
        let base = &self.manifests_dir;
        visit_files(base, &mut |path, _meta| {
            let rel = match path.strip_prefix(base) {
                Ok(rel) => rel,
                Err(_) => return,
            };
            let parts: Vec<String> = rel
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .filter_map(unescape_component)
                .collect();
            if let [registry, namespace, repo, tag] = parts.as_slice() {
                keys.push(ManifestKey::new(
                    registry.as_str(),
                    namespace.as_str(),
                    repo.as_str(),
                    tag.as_str(),
                ));
            }
        })?;
        Ok(keys)
    }

    /// Remove all persisted state and recreate the empty namespaces.
    pub fn clear(&self) -> AppResult<()> {
        for dir in [&self.blobs_dir, &self.manifests_dir] {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(AppError::Io(e)),
            }
            fs::create_dir_all(dir)?;
        }
        info!(root = %self.root.display(), "Cleared cache");
        Ok(())
    }
}

fn update_newest(newest: &mut Option<DateTime<Utc>>, meta: &fs::Metadata) {
    if let Ok(modified) = meta.modified() {
        let modified: DateTime<Utc> = modified.into();
        if newest.map(|prev| modified > prev).unwrap_or(true) {
            *newest = Some(modified);
        }
    }
}

fn visit_files(dir: &Path, f: &mut dyn FnMut(&Path, &fs::Metadata)) -> AppResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(AppError::Io(e)),
    };
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        let path = entry.path();
        if meta.is_dir() {
            visit_files(&path, f)?;
        } else if meta.is_file() {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(TEMP_SUFFIX) {
                continue;
            }
            f(&path, &meta);
        }
    }
    Ok(())
}

fn validate_key(key: &ManifestKey) -> AppResult<()> {
    for (field, value) in [
        ("registry", &key.registry),
        ("namespace", &key.namespace),
        ("repo", &key.repo),
        ("tag", &key.tag),
    ] {
        if value.is_empty() {
            return Err(AppError::BadRequest(format!(
                "manifest key {field} must not be empty"
            )));
        }
    }
    Ok(())
}

/// Map one manifest-key component to a filesystem-safe path segment.
///
/// Bytes outside `[A-Za-z0-9._-]` become `%XX`; `%` itself is always
/// escaped, which makes the mapping injective. The components `.` and `..`
/// are escaped entirely so no key can name a parent directory.
fn escape_component(s: &str) -> String {
    if s == "." || s == ".." {
        return s.bytes().map(|b| format!("%{b:02X}")).collect();
    }
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Inverse of [`escape_component`]. Returns `None` for malformed input.
fn unescape_component(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1)?;
            let lo = bytes.get(i + 2)?;
            let hex = [*hi, *lo];
            let hex = std::str::from_utf8(&hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
