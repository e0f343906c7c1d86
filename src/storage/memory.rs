//! In-memory storage backend.
//!
//! Keeps every payload in a `HashMap` behind an `RwLock`.  Useful for
//! tests and throwaway deployments; contents vanish with the process.

use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;
use std::time::SystemTime;

use super::backend::{
    md5_hex, BackendEntry, BackendError, BackendResult, ContentHead, KeyOrder, StorageBackend,
    StoredContent,
};

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    content_type: String,
    mtime: SystemTime,
}

/// Stores payloads in process memory.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<String>> + Send + '_>> {
        let key = key.to_string();
        let content_type = content_type.to_string();
        Box::pin(async move {
            let etag = md5_hex(&data);
            let mut entries = self.entries.write().expect("lock poisoned");
            entries.insert(
                key,
                Entry {
                    data,
                    content_type,
                    mtime: SystemTime::now(),
                },
            );
            Ok(etag)
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<StoredContent>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let entries = self.entries.read().expect("lock poisoned");
            let entry = entries
                .get(&key)
                .ok_or_else(|| BackendError::not_found(&key))?;
            Ok(StoredContent {
                data: entry.data.clone(),
                content_type: Some(entry.content_type.clone()),
                etag: md5_hex(&entry.data),
            })
        })
    }

    fn head(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<ContentHead>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let entries = self.entries.read().expect("lock poisoned");
            let entry = entries
                .get(&key)
                .ok_or_else(|| BackendError::not_found(&key))?;
            Ok(ContentHead {
                size: entry.data.len() as u64,
                content_type: Some(entry.content_type.clone()),
                mtime: entry.mtime,
            })
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut entries = self.entries.write().expect("lock poisoned");
            if entries.remove(&key).is_none() {
                return Err(BackendError::not_found(key));
            }
            Ok(())
        })
    }

    fn delete_prefix(
        &self,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<u64>> + Send + '_>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let mut entries = self.entries.write().expect("lock poisoned");
            let before = entries.len();
            entries.retain(|key, _| !key.starts_with(&prefix));
            Ok((before - entries.len()) as u64)
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
            let entries = self.entries.read().expect("lock poisoned");
            let mut matches: Vec<BackendEntry> = entries
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(key, entry)| BackendEntry {
                    key: key.clone(),
                    size: entry.data.len() as u64,
                })
                .collect();
            matches.sort_by(|a, b| a.key.cmp(&b.key));
            if order == KeyOrder::Desc {
                matches.reverse();
            }
            Ok(matches
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
            let mut entries = self.entries.write().expect("lock poisoned");
            let entry = entries
                .get(&src)
                .ok_or_else(|| BackendError::not_found(&src))?
                .clone();
            let etag = md5_hex(&entry.data);
            entries.insert(
                dst,
                Entry {
                    mtime: SystemTime::now(),
                    ..entry
                },
            );
            Ok(etag)
        })
    }

    fn exists(&self, key: &str) -> Pin<Box<dyn Future<Output = BackendResult<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let entries = self.entries.read().expect("lock poisoned");
            Ok(entries.contains_key(&key))
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
