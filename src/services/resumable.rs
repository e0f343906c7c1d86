//! Resumable upload service.
//!
//! Implements the session lifecycle behind the TUS-style protocol:
//! create, append chunks, finalize into the object service, cancel,
//! and a background expiry sweep.  Staging bytes live in the backend
//! under `uploads/{session_id}` and are owned by the session: deleting
//! a session always removes its staging content.
//!
//! Chunk writes, finalize, and cancel are serialized by one
//! service-wide async mutex, so for any session the offset is
//! monotonically non-decreasing and finalize runs at most once.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::auth::AuthContext;
use crate::errors::ApiError;
use crate::metadata::store::{now_rfc3339, MetadataStore, ProposedObject, UploadSessionRecord};
use crate::mime;
use crate::services::object::{ObjectService, UploadOutcome, UploadRequest};
use crate::storage::backend::StorageBackend;

/// Request to open a resumable upload session.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    pub bucket_name: String,
    pub object_name: String,
    pub upload_length: u64,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub metadata: HashMap<String, String>,
    pub upsert: bool,
}

/// Result of one chunk append.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOutcome {
    /// Committed offset after the append.
    pub offset: u64,
    /// True when the session has received every declared byte.
    pub complete: bool,
}

/// Session lifecycle and staging management.
pub struct ResumableUploadService {
    db: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageBackend>,
    objects: Arc<ObjectService>,
    /// Serializes write_chunk / finalize / cancel across all sessions.
    chunk_lock: Mutex<()>,
    /// Service-wide cap on declared lengths (0 = unlimited).
    max_size: u64,
    /// Session lifetime in seconds.
    session_ttl_seconds: u64,
}

impl ResumableUploadService {
    pub fn new(
        db: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageBackend>,
        objects: Arc<ObjectService>,
        max_size: u64,
        session_ttl_seconds: u64,
    ) -> Self {
        Self {
            db,
            storage,
            objects,
            chunk_lock: Mutex::new(()),
            max_size,
            session_ttl_seconds,
        }
    }

    /// Largest declared length this service accepts (0 = unlimited).
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Backend key for a session's staging bytes.
    fn staging_key(session_id: &str) -> String {
        format!("uploads/{session_id}")
    }

    fn expired(session: &UploadSessionRecord, now: &str) -> bool {
        session.expires_at.as_str() < now
    }

    // ── Create ──────────────────────────────────────────────────────

    /// Open a session: validate length and bucket limits, check the
    /// insert policy, persist the row, and create empty staging content.
    pub async fn create(
        &self,
        auth: &AuthContext,
        req: CreateSessionRequest,
    ) -> Result<UploadSessionRecord, ApiError> {
        ObjectService::validate_object_name(&req.object_name)?;
        let bucket = self
            .db
            .get_bucket_by_name(&req.bucket_name)
            .await?
            .ok_or_else(|| ApiError::not_found("bucket"))?;

        if self.max_size > 0 && req.upload_length > self.max_size {
            return Err(ApiError::TooLarge {
                limit: self.max_size,
            });
        }
        if let Some(limit) = bucket.file_size_limit {
            if req.upload_length > limit {
                return Err(ApiError::TooLarge { limit });
            }
        }
        if let (Some(content_type), Some(patterns)) =
            (&req.content_type, &bucket.allowed_mime_types)
        {
            if !mime::is_allowed(content_type, patterns) {
                return Err(ApiError::MimeNotAllowed {
                    content_type: content_type.clone(),
                });
            }
        }

        self.objects
            .check_insert(
                auth,
                ProposedObject {
                    bucket_id: bucket.id.clone(),
                    name: req.object_name.clone(),
                    owner_id: auth.user_id.clone(),
                },
            )
            .await?;

        if !req.upsert && self.db.object_exists(&bucket.id, &req.object_name).await? {
            return Err(ApiError::ObjectExists);
        }

        let id = hex::encode(rand::random::<[u8; 16]>());
        let temp_key = Self::staging_key(&id);
        let now = chrono::Utc::now();
        let expires = now + chrono::Duration::seconds(self.session_ttl_seconds as i64);

        let record = UploadSessionRecord {
            id: id.clone(),
            bucket_id: bucket.id,
            object_name: req.object_name,
            owner_id: auth.user_id.clone(),
            upload_length: req.upload_length,
            upload_offset: 0,
            content_type: req
                .content_type
                .unwrap_or_else(|| mime::OCTET_STREAM.to_string()),
            cache_control: req.cache_control,
            metadata: req.metadata,
            upsert: req.upsert,
            temp_key: temp_key.clone(),
            created_at: now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            expires_at: expires.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        };

        self.storage
            .put(&temp_key, Bytes::new(), mime::OCTET_STREAM)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;

        if !self.db.insert_session(record.clone()).await? {
            // Another live session already targets this object.
            if let Err(err) = self.storage.delete(&temp_key).await {
                if !err.is_not_found() {
                    warn!(key = %temp_key, error = %err, "staging cleanup failed");
                }
            }
            return Err(ApiError::ObjectExists);
        }

        info!(session = %id, length = record.upload_length, "upload session created");
        Ok(record)
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Current offset and declared length, for protocol HEAD.
    pub async fn head(&self, id: &str) -> Result<(u64, u64), ApiError> {
        let session = self
            .db
            .get_session(id)
            .await?
            .ok_or_else(|| ApiError::not_found("upload session"))?;
        if Self::expired(&session, &now_rfc3339()) {
            return Err(ApiError::SessionExpired);
        }
        Ok((session.upload_offset, session.upload_length))
    }

    // ── Append ──────────────────────────────────────────────────────

    /// Append a chunk at `declared_offset`.
    ///
    /// Bytes beyond the declared length are discarded, and the offset
    /// is committed only after the staging write succeeds, so a client
    /// retrying after a network error either advances once or sees an
    /// `offset_mismatch`, never a double append.
    pub async fn write_chunk(
        &self,
        id: &str,
        declared_offset: u64,
        data: Bytes,
    ) -> Result<ChunkOutcome, ApiError> {
        let _guard = self.chunk_lock.lock().await;

        let session = self
            .db
            .get_session(id)
            .await?
            .ok_or_else(|| ApiError::not_found("upload session"))?;
        if Self::expired(&session, &now_rfc3339()) {
            return Err(ApiError::SessionExpired);
        }
        if declared_offset != session.upload_offset {
            return Err(ApiError::OffsetMismatch {
                expected: session.upload_offset,
                got: declared_offset,
            });
        }

        let remaining = session.upload_length - session.upload_offset;
        let take = (data.len() as u64).min(remaining) as usize;
        let chunk = data.slice(0..take);

        let staging = match self.storage.get(&session.temp_key).await {
            Ok(content) => content.data,
            Err(err) if err.is_not_found() => Bytes::new(),
            Err(err) => return Err(ApiError::Internal(err.into())),
        };

        let mut combined = BytesMut::with_capacity(staging.len() + chunk.len());
        combined.extend_from_slice(&staging);
        combined.extend_from_slice(&chunk);
        self.storage
            .put(&session.temp_key, combined.freeze(), mime::OCTET_STREAM)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;

        let new_offset = session.upload_offset + take as u64;
        if !self
            .db
            .advance_session_offset(id, session.upload_offset, new_offset)
            .await?
        {
            // The stored offset moved underneath us; report it like any
            // other stale-offset write.
            let current = self
                .db
                .get_session(id)
                .await?
                .map(|s| s.upload_offset)
                .unwrap_or(0);
            return Err(ApiError::OffsetMismatch {
                expected: current,
                got: declared_offset,
            });
        }

        debug!(session = %id, offset = new_offset, "chunk appended");
        Ok(ChunkOutcome {
            offset: new_offset,
            complete: new_offset == session.upload_length,
        })
    }

    // ── Finalize / cancel ───────────────────────────────────────────

    /// Hand the assembled staging bytes to the object service, then
    /// drop the session and its staging content.
    ///
    /// If the upload fails, staging and session survive and finalize
    /// can be retried.  If only the session cleanup fails, the object
    /// exists and the expiry sweep removes the leftovers later.
    pub async fn finalize(&self, id: &str) -> Result<UploadOutcome, ApiError> {
        let _guard = self.chunk_lock.lock().await;

        let session = self
            .db
            .get_session(id)
            .await?
            .ok_or_else(|| ApiError::not_found("upload session"))?;
        if Self::expired(&session, &now_rfc3339()) {
            return Err(ApiError::SessionExpired);
        }
        if session.upload_offset != session.upload_length {
            return Err(ApiError::InvalidRequest {
                message: format!(
                    "upload incomplete: {} of {} bytes received",
                    session.upload_offset, session.upload_length
                ),
            });
        }

        let staging = match self.storage.get(&session.temp_key).await {
            Ok(content) => content.data,
            Err(err) if err.is_not_found() && session.upload_length == 0 => Bytes::new(),
            Err(err) => return Err(ApiError::Internal(err.into())),
        };

        let bucket = self
            .db
            .get_bucket(&session.bucket_id)
            .await?
            .ok_or_else(|| ApiError::not_found("bucket"))?;

        // Policy was enforced when the session was created; the upload
        // itself runs privileged on the session's recorded owner.
        let finalize_auth = AuthContext {
            user_id: session.owner_id.clone(),
            email: None,
            role: crate::auth::SERVICE_ROLE.to_string(),
            claims: HashMap::new(),
            bypass: true,
        };
        let outcome = self
            .objects
            .upload(
                &finalize_auth,
                &bucket.name,
                &session.object_name,
                staging,
                UploadRequest {
                    content_type: Some(session.content_type.clone()),
                    user_metadata: session.metadata.clone(),
                    owner: session.owner_id.clone(),
                    upsert: session.upsert,
                },
            )
            .await?;

        if let Err(err) = self.db.delete_session(id).await {
            warn!(session = %id, error = %err,
                  "session row survived finalize; sweep will reclaim it");
        }
        if let Err(err) = self.storage.delete(&session.temp_key).await {
            if !err.is_not_found() {
                warn!(session = %id, error = %err,
                      "staging content survived finalize; sweep will reclaim it");
            }
        }

        info!(session = %id, object = %session.object_name, "upload finalized");
        Ok(outcome)
    }

    /// Drop a session and its staging content.
    pub async fn cancel(&self, id: &str) -> Result<(), ApiError> {
        let _guard = self.chunk_lock.lock().await;

        let session = self
            .db
            .get_session(id)
            .await?
            .ok_or_else(|| ApiError::not_found("upload session"))?;

        if let Err(err) = self.storage.delete(&session.temp_key).await {
            if !err.is_not_found() {
                return Err(ApiError::Internal(err.into()));
            }
        }
        self.db.delete_session(id).await?;
        info!(session = %id, "upload session cancelled");
        Ok(())
    }

    // ── Expiry sweep ────────────────────────────────────────────────

    /// Remove every session expired as of `now`, staging content first.
    /// Runs without the chunk lock and deletes one session at a time.
    pub async fn sweep_once(&self, now: &str) -> Result<u64, ApiError> {
        let expired = self.db.list_expired_sessions(now, 500).await?;
        let mut cleaned = 0u64;

        for session in expired {
            if let Err(err) = self.storage.delete(&session.temp_key).await {
                if !err.is_not_found() {
                    warn!(session = %session.id, error = %err,
                          "sweep could not remove staging content");
                    continue;
                }
            }
            match self.db.delete_session(&session.id).await {
                Ok(_) => cleaned += 1,
                Err(err) => {
                    warn!(session = %session.id, error = %err,
                          "sweep could not remove session row");
                }
            }
        }

        if cleaned > 0 {
            info!(cleaned, "expired upload sessions swept");
        }
        Ok(cleaned)
    }

    /// Periodic sweep loop; exits when `shutdown` flips to true.
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval_seconds: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once(&now_rfc3339()).await {
                        warn!(error = %err, "expiry sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("expiry sweeper stopped");
                        return;
                    }
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::policy::{ConfigPolicyEngine, PolicyEngine};
    use crate::services::bucket::{BucketService, CreateBucketRequest};

    struct Harness {
        uploads: ResumableUploadService,
        objects: Arc<ObjectService>,
        db: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageBackend>,
    }

    async fn harness_with_limits(max_size: u64, bucket_limit: Option<u64>) -> Harness {
        let db: Arc<dyn MetadataStore> =
            Arc::new(SqliteMetadataStore::new(":memory:").expect("in-memory store"));
        let storage: Arc<dyn StorageBackend> =
            Arc::new(crate::storage::memory::MemoryBackend::new());
        let engine: Arc<dyn PolicyEngine> =
            Arc::new(ConfigPolicyEngine::new(&PolicyConfig::default()));
        let objects = Arc::new(ObjectService::new(db.clone(), storage.clone(), engine, 0));
        let uploads = ResumableUploadService::new(
            db.clone(),
            storage.clone(),
            objects.clone(),
            max_size,
            3600,
        );

        let buckets = BucketService::new(db.clone(), storage.clone());
        buckets
            .create(
                CreateBucketRequest {
                    name: "vault".to_string(),
                    file_size_limit: bucket_limit,
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        Harness {
            uploads,
            objects,
            db,
            storage,
        }
    }

    async fn harness() -> Harness {
        harness_with_limits(0, None).await
    }

    fn create_req(name: &str, length: u64) -> CreateSessionRequest {
        CreateSessionRequest {
            bucket_name: "vault".to_string(),
            object_name: name.to_string(),
            upload_length: length,
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn two_chunk_upload_finalizes_into_object() {
        let h = harness().await;
        let auth = AuthContext::anonymous();

        let session = h.uploads.create(&auth, create_req("a.txt", 10)).await.unwrap();
        assert_eq!(session.upload_offset, 0);

        let first = h
            .uploads
            .write_chunk(&session.id, 0, Bytes::from("01234"))
            .await
            .unwrap();
        assert_eq!(first.offset, 5);
        assert!(!first.complete);

        let (offset, length) = h.uploads.head(&session.id).await.unwrap();
        assert_eq!((offset, length), (5, 10));

        let second = h
            .uploads
            .write_chunk(&session.id, 5, Bytes::from("56789"))
            .await
            .unwrap();
        assert!(second.complete);

        let outcome = h.uploads.finalize(&session.id).await.unwrap();
        assert_eq!(outcome.size, 10);

        // Session and staging are gone; the object is readable.
        assert_eq!(
            h.uploads.head(&session.id).await.unwrap_err().code(),
            "not_found"
        );
        assert!(!h
            .storage
            .exists(&format!("uploads/{}", session.id))
            .await
            .unwrap());

        let (_, content) = h
            .objects
            .download(&auth, "vault", "a.txt")
            .await
            .unwrap();
        assert_eq!(content.data, Bytes::from("0123456789"));
    }

    #[tokio::test]
    async fn wrong_offset_is_conflict() {
        let h = harness().await;
        let auth = AuthContext::anonymous();
        let session = h.uploads.create(&auth, create_req("a.txt", 10)).await.unwrap();

        h.uploads
            .write_chunk(&session.id, 0, Bytes::from("01234"))
            .await
            .unwrap();

        let err = h
            .uploads
            .write_chunk(&session.id, 0, Bytes::from("01234"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "offset_mismatch");

        // Offset is unchanged by the failed write.
        let (offset, _) = h.uploads.head(&session.id).await.unwrap();
        assert_eq!(offset, 5);
    }

    #[tokio::test]
    async fn chunk_past_declared_length_is_truncated() {
        let h = harness().await;
        let auth = AuthContext::anonymous();
        let session = h.uploads.create(&auth, create_req("a.txt", 4)).await.unwrap();

        let outcome = h
            .uploads
            .write_chunk(&session.id, 0, Bytes::from("0123456789"))
            .await
            .unwrap();
        assert_eq!(outcome.offset, 4);
        assert!(outcome.complete);

        let outcome = h.uploads.finalize(&session.id).await.unwrap();
        assert_eq!(outcome.size, 4);
    }

    #[tokio::test]
    async fn create_validates_lengths() {
        let h = harness_with_limits(100, Some(16)).await;
        let auth = AuthContext::anonymous();

        // Service cap.
        let err = h
            .uploads
            .create(&auth, create_req("a.txt", 200))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "too_large");

        // Bucket cap.
        let err = h
            .uploads
            .create(&auth, create_req("a.txt", 32))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "too_large");

        h.uploads.create(&auth, create_req("a.txt", 16)).await.unwrap();
    }

    #[tokio::test]
    async fn finalize_requires_completion() {
        let h = harness().await;
        let auth = AuthContext::anonymous();
        let session = h.uploads.create(&auth, create_req("a.txt", 10)).await.unwrap();

        h.uploads
            .write_chunk(&session.id, 0, Bytes::from("01234"))
            .await
            .unwrap();

        let err = h.uploads.finalize(&session.id).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        // Still resumable afterwards.
        let (offset, _) = h.uploads.head(&session.id).await.unwrap();
        assert_eq!(offset, 5);
    }

    #[tokio::test]
    async fn cancel_removes_row_and_staging() {
        let h = harness().await;
        let auth = AuthContext::anonymous();
        let session = h.uploads.create(&auth, create_req("a.txt", 10)).await.unwrap();
        h.uploads
            .write_chunk(&session.id, 0, Bytes::from("01234"))
            .await
            .unwrap();

        h.uploads.cancel(&session.id).await.unwrap();

        assert_eq!(
            h.uploads.head(&session.id).await.unwrap_err().code(),
            "not_found"
        );
        assert!(!h
            .storage
            .exists(&format!("uploads/{}", session.id))
            .await
            .unwrap());
        assert_eq!(
            h.uploads.cancel(&session.id).await.unwrap_err().code(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn duplicate_session_for_same_object_is_conflict() {
        let h = harness().await;
        let auth = AuthContext::anonymous();
        h.uploads.create(&auth, create_req("a.txt", 10)).await.unwrap();

        let err = h
            .uploads
            .create(&auth, create_req("a.txt", 10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "object_exists");
    }

    #[tokio::test]
    async fn create_without_upsert_refuses_existing_object() {
        let h = harness().await;
        let auth = AuthContext::anonymous();
        h.objects
            .upload(
                &auth,
                "vault",
                "a.txt",
                Bytes::from("old"),
                UploadRequest {
                    content_type: Some("text/plain".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = h
            .uploads
            .create(&auth, create_req("a.txt", 3))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "object_exists");

        // With upsert the session opens and finalize overwrites.
        let mut req = create_req("a.txt", 3);
        req.upsert = true;
        let session = h.uploads.create(&auth, req).await.unwrap();
        h.uploads
            .write_chunk(&session.id, 0, Bytes::from("new"))
            .await
            .unwrap();
        h.uploads.finalize(&session.id).await.unwrap();

        let (_, content) = h
            .objects
            .download(&auth, "vault", "a.txt")
            .await
            .unwrap();
        assert_eq!(content.data, Bytes::from("new"));
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_sessions() {
        let h = harness().await;
        let auth = AuthContext::anonymous();
        let live = h.uploads.create(&auth, create_req("live.txt", 5)).await.unwrap();
        let doomed = h
            .uploads
            .create(&auth, create_req("doomed.txt", 5))
            .await
            .unwrap();
        h.uploads
            .write_chunk(&doomed.id, 0, Bytes::from("01"))
            .await
            .unwrap();

        // Two hours from now every 1-hour session has lapsed; the far
        // future timestamp stands in for an advanced clock.
        let later = (chrono::Utc::now() + chrono::Duration::hours(2))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

        let cleaned = h.uploads.sweep_once(&later).await.unwrap();
        assert_eq!(cleaned, 2);
        assert!(!h
            .storage
            .exists(&format!("uploads/{}", doomed.id))
            .await
            .unwrap());

        // Sweeping at the real current time removes nothing.
        let live2 = h.uploads.create(&auth, create_req("live2.txt", 5)).await.unwrap();
        let cleaned = h.uploads.sweep_once(&now_rfc3339()).await.unwrap();
        assert_eq!(cleaned, 0);
        assert!(h.db.get_session(&live2.id).await.unwrap().is_some());

        let _ = live;
    }

    #[tokio::test]
    async fn expired_session_reports_gone() {
        let h = harness().await;
        let auth = AuthContext::anonymous();
        let session = h.uploads.create(&auth, create_req("a.txt", 5)).await.unwrap();

        // Rewind the expiry by rewriting the row.
        let mut record = h.db.get_session(&session.id).await.unwrap().unwrap();
        h.db.delete_session(&session.id).await.unwrap();
        record.expires_at = "2000-01-01T00:00:00.000Z".to_string();
        h.db.insert_session(record).await.unwrap();

        assert_eq!(
            h.uploads.head(&session.id).await.unwrap_err().code(),
            "session_expired"
        );
        assert_eq!(
            h.uploads
                .write_chunk(&session.id, 0, Bytes::from("x"))
                .await
                .unwrap_err()
                .code(),
            "session_expired"
        );
    }

    #[tokio::test]
    async fn offsets_never_decrease() {
        let h = harness().await;
        let auth = AuthContext::anonymous();
        let session = h.uploads.create(&auth, create_req("a.txt", 6)).await.unwrap();

        let mut last = 0;
        for (offset, chunk) in [(0u64, "ab"), (2, "cd"), (4, "ef")] {
            let outcome = h
                .uploads
                .write_chunk(&session.id, offset, Bytes::from(chunk))
                .await
                .unwrap();
            assert!(outcome.offset >= last);
            assert!(outcome.offset <= 6);
            last = outcome.offset;
        }
        assert_eq!(last, 6);
    }
}
