//! Abstract storage backend trait.
//!
//! Every byte-store backend must implement [`StorageBackend`].  The
//! trait works in terms of opaque keys and byte payloads so callers do
//! not need to know the underlying medium.  Backends never consult the
//! metadata store.
//!
//! Key layout used by the services:
//!   Objects:  `{bucket_id}/{object_name}`
//!   Staging:  `uploads/{session_id}`

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;
use thiserror::Error;

/// Backend failure kinds.
///
/// `NotFound` lets delete paths recover idempotently; `Conflict` is for
/// backends that cannot overwrite in place; everything else wraps the
/// transport.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no content at key {key}")]
    NotFound { key: String },

    #[error("content already exists at key {key}")]
    Conflict { key: String },

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl BackendError {
    pub fn not_found(key: impl Into<String>) -> Self {
        BackendError::NotFound { key: key.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A stored payload plus its descriptors.
#[derive(Debug, Clone)]
pub struct StoredContent {
    /// Raw bytes.
    pub data: Bytes,
    /// Content type, when the backend records one.
    pub content_type: Option<String>,
    /// Hex MD5 of the bytes.
    pub etag: String,
}

/// Descriptors returned by `head` without fetching bytes.
#[derive(Debug, Clone)]
pub struct ContentHead {
    pub size: u64,
    pub content_type: Option<String>,
    pub mtime: SystemTime,
}

/// One entry from a prefix listing.
#[derive(Debug, Clone)]
pub struct BackendEntry {
    pub key: String,
    pub size: u64,
}

/// Key ordering for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyOrder {
    #[default]
    Asc,
    Desc,
}

/// Async byte-store contract.
///
/// Implementations must be safe for concurrent calls on distinct keys,
/// and `put` must be atomic from a reader's perspective: concurrent
/// readers see either the old or the complete new value, never a torn
/// write.
pub trait StorageBackend: Send + Sync + 'static {
    /// Write `data` to `key`, returning the hex MD5 of the payload.
    fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<String>> + Send + '_>>;

    /// Read the full payload at `key`.
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<StoredContent>> + Send + '_>>;

    /// Read descriptors without the payload.
    fn head(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<ContentHead>> + Send + '_>>;

    /// Delete the payload at `key`.  Missing keys report `NotFound`;
    /// callers on delete paths recover that case.
    fn delete(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>>;

    /// Delete every key starting with `prefix`.  Returns the number of
    /// payloads removed (zero is not an error).
    fn delete_prefix(
        &self,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<u64>> + Send + '_>>;

    /// List keys starting with `prefix`, ordered by key.
    fn list(
        &self,
        prefix: &str,
        limit: u32,
        offset: u32,
        order: KeyOrder,
    ) -> Pin<Box<dyn Future<Output = BackendResult<Vec<BackendEntry>>> + Send + '_>>;

    /// Copy `src` to `dst`, returning the hex MD5 of the copy.
    fn copy(
        &self,
        src: &str,
        dst: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<String>> + Send + '_>>;

    /// Check whether a payload exists at `key`.
    fn exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<bool>> + Send + '_>>;
}

/// Compute the hex MD5 digest of a payload.
pub fn md5_hex(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_of_known_inputs() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"hi"), "49f68a5c8493ec2c0bf489821c21fc3b");
    }

    #[test]
    fn not_found_predicate() {
        assert!(BackendError::not_found("a/b").is_not_found());
        assert!(!BackendError::Io(anyhow::anyhow!("x")).is_not_found());
    }
}
