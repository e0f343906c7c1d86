//! Local filesystem storage backend.
//!
//! Payloads are stored as flat files under a configurable root
//! directory; the storage key is used directly as a relative path
//! (e.g., "bucket/a/b.txt").  Writes follow crash-only design: write to
//! a temp file, fsync, rename.  Content types are not persisted; the
//! metadata store is the source of truth for them.

use bytes::Bytes;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use super::backend::{
    md5_hex, BackendEntry, BackendError, BackendResult, ContentHead, KeyOrder, StorageBackend,
    StoredContent,
};

/// Stores payloads on the local filesystem.
pub struct LocalBackend {
    /// Root directory for all stored content.
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        // Also create the .tmp directory for atomic writes.
        std::fs::create_dir_all(root.join(".tmp"))?;
        Ok(Self { root })
    }

    /// Resolve a storage key to an absolute file path.
    ///
    /// Rejects keys containing parent-directory components so a key can
    /// never escape the root.
    fn resolve(&self, key: &str) -> BackendResult<PathBuf> {
        for component in Path::new(key).components() {
            if let std::path::Component::ParentDir = component {
                return Err(BackendError::Io(anyhow::anyhow!(
                    "path traversal detected in storage key: {key}"
                )));
            }
        }
        Ok(self.root.join(key))
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(".tmp").join(format!("tmp-{id}"))
    }

    /// Crash-only write: temp file, fsync, atomic rename into place.
    fn write_atomic(&self, final_path: &Path, data: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.temp_path();
        if let Some(parent) = tmp_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, final_path)?;
        Ok(())
    }

    /// Collect `(key, size)` for every file whose key starts with
    /// `prefix`, skipping the .tmp area.
    fn collect_keys(&self, prefix: &str) -> anyhow::Result<Vec<BackendEntry>> {
        // Walk from the deepest directory the prefix fully names, so a
        // partial final segment ("bucket/dra") still matches.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let base = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.root.join(dir_part)
        };

        let mut entries = Vec::new();
        if base.exists() {
            walk(&self.root, &base, &mut entries)?;
        }
        entries.retain(|e| e.key.starts_with(prefix));
        Ok(entries)
    }
}

/// Recursively collect files under `dir` as root-relative entries.
fn walk(root: &Path, dir: &Path, out: &mut Vec<BackendEntry>) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if path.file_name().is_some_and(|n| n == ".tmp") {
                continue;
            }
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| anyhow::anyhow!("path outside root: {e}"))?;
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(BackendEntry {
                key,
                size: entry.metadata()?.len(),
            });
        }
    }
    Ok(())
}

impl StorageBackend for LocalBackend {
    fn put(
        &self,
        key: &str,
        data: Bytes,
        _content_type: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<String>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let final_path = self.resolve(&key)?;
            let etag = md5_hex(&data);
            self.write_atomic(&final_path, &data)
                .map_err(BackendError::Io)?;
            Ok(etag)
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<StoredContent>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            if !path.is_file() {
                return Err(BackendError::not_found(key));
            }
            let data = Bytes::from(std::fs::read(&path).map_err(anyhow::Error::from)?);
            let etag = md5_hex(&data);
            Ok(StoredContent {
                data,
                content_type: None,
                etag,
            })
        })
    }

    fn head(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<ContentHead>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            if !path.is_file() {
                return Err(BackendError::not_found(key));
            }
            let meta = std::fs::metadata(&path).map_err(anyhow::Error::from)?;
            Ok(ContentHead {
                size: meta.len(),
                content_type: None,
                mtime: meta.modified().map_err(anyhow::Error::from)?,
            })
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            if !path.is_file() {
                return Err(BackendError::not_found(key));
            }
            std::fs::remove_file(&path).map_err(anyhow::Error::from)?;
            Ok(())
        })
    }

    fn delete_prefix(
        &self,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<u64>> + Send + '_>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let entries = self.collect_keys(&prefix).map_err(BackendError::Io)?;
            let mut removed = 0u64;
            for entry in entries {
                let path = self.resolve(&entry.key)?;
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn list(
        &self,
        prefix: &str,
        limit: u32,
        offset: u32,
        order: KeyOrder,
    ) -> Pin<Box<dyn Future<Output = BackendResult<Vec<BackendEntry>>> + Send + '_>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let mut entries = self.collect_keys(&prefix).map_err(BackendError::Io)?;
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            if order == KeyOrder::Desc {
                entries.reverse();
            }
            Ok(entries
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect())
        })
    }

    fn copy(
        &self,
        src: &str,
        dst: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<String>> + Send + '_>> {
        let src = src.to_string();
        let dst = dst.to_string();
        Box::pin(async move {
            let src_path = self.resolve(&src)?;
            if !src_path.is_file() {
                return Err(BackendError::not_found(src));
            }
            let dst_path = self.resolve(&dst)?;

            let data = std::fs::read(&src_path).map_err(anyhow::Error::from)?;
            let etag = md5_hex(&data);
            self.write_atomic(&dst_path, &data)
                .map_err(BackendError::Io)?;
            Ok(etag)
        })
    }

    fn exists(&self, key: &str) -> Pin<Box<dyn Future<Output = BackendResult<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            Ok(path.is_file())
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
