//! Object service: upload, download, copy, move, delete.
//!
//! Composes the byte-store backend with the metadata store and
//! enforces bucket limits and row-level policy.  Ordering guarantees:
//! an object row becomes visible only after its bytes are fully
//! written; a delete removes the row first and the bytes second, so a
//! reader that cannot see the row can never fetch the bytes through
//! this service.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use crate::auth::AuthContext;
use crate::errors::ApiError;
use crate::metadata::store::{
    now_rfc3339, path_tokens, ListObjectsQuery, MetadataStore, ObjectRecord, ProposedObject,
    RowPolicy,
};
use crate::mime;
use crate::policy::{PolicyEngine, OBJECTS_TABLE};
use crate::storage::backend::{BackendError, StorageBackend, StoredContent};

/// Result of a committed upload or copy.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    /// `{bucket_name}/{object_name}`.
    pub key: String,
    /// Surrogate id of the object row.
    pub id: String,
    /// Hex MD5 of the content.
    pub etag: String,
    /// Content length in bytes.
    pub size: u64,
}

/// Which predicate family an operation needs.
#[derive(Debug, Clone, Copy)]
enum Action {
    Select,
    Insert,
    Delete,
}

/// Resolved policy outcome for one (caller, action) pair.
enum Access {
    /// Enforcement off or privileged caller.
    Unrestricted,
    /// Rows are filtered by this predicate.
    Filtered(RowPolicy),
    /// Empty predicate while enforcement is on: denied outright.
    Denied,
}

impl Access {
    fn policy(&self) -> Option<&RowPolicy> {
        match self {
            Access::Filtered(p) => Some(p),
            _ => None,
        }
    }
}

/// Everything needed to write one object.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Declared content type; sniffed from bytes/name when absent.
    pub content_type: Option<String>,
    /// User-defined metadata.
    pub user_metadata: HashMap<String, String>,
    /// Owner the row is attributed to.
    pub owner: Option<String>,
    /// Overwrite an existing object.
    pub upsert: bool,
}

/// Object-level operations over one backend and one metadata store.
pub struct ObjectService {
    db: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageBackend>,
    policy: Arc<dyn PolicyEngine>,
    /// Service-wide cap on direct upload size (0 = unlimited).
    max_object_size: u64,
}

impl ObjectService {
    pub fn new(
        db: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageBackend>,
        policy: Arc<dyn PolicyEngine>,
        max_object_size: u64,
    ) -> Self {
        Self {
            db,
            storage,
            policy,
            max_object_size,
        }
    }

    /// Backend key for an object.
    pub fn object_key(bucket_id: &str, name: &str) -> String {
        format!("{bucket_id}/{name}")
    }

    /// Validate an object path: non-empty, no empty or dot-dot segments.
    pub fn validate_object_name(name: &str) -> Result<(), ApiError> {
        let bad = || ApiError::InvalidRequest {
            message: format!("invalid object name: {name:?}"),
        };
        if name.is_empty() || name.ends_with('/') || name.starts_with('/') {
            return Err(bad());
        }
        if name.split('/').any(|seg| seg.is_empty() || seg == "..") {
            return Err(bad());
        }
        Ok(())
    }

    /// Resolve the caller's access for one action.  Policy-engine
    /// failures are surfaced, never treated as allow.
    fn access_for(&self, auth: &AuthContext, action: Action) -> Result<Access, ApiError> {
        if auth.bypass || !self.policy.is_enabled(OBJECTS_TABLE) {
            return Ok(Access::Unrestricted);
        }
        let fragment = match action {
            Action::Select => self.policy.select_predicate(OBJECTS_TABLE, auth)?,
            Action::Insert => self.policy.insert_predicate(OBJECTS_TABLE, auth)?,
            Action::Delete => self.policy.delete_predicate(OBJECTS_TABLE, auth)?,
        };
        if fragment.trim().is_empty() {
            return Ok(Access::Denied);
        }
        Ok(Access::Filtered(RowPolicy {
            fragment,
            user_id: auth.user_id.clone(),
            email: auth.email.clone(),
            role: auth.role.clone(),
        }))
    }

    /// Check the insert predicate against a proposed row.  Also used
    /// by the resumable service when a session is opened.
    pub async fn check_insert(
        &self,
        auth: &AuthContext,
        proposed: ProposedObject,
    ) -> Result<(), ApiError> {
        match self.access_for(auth, Action::Insert)? {
            Access::Unrestricted => Ok(()),
            Access::Denied => Err(ApiError::AccessDenied {
                message: "no insert policy for role".to_string(),
            }),
            Access::Filtered(policy) => {
                if self.db.check_insert_allowed(&policy, &proposed).await? {
                    Ok(())
                } else {
                    Err(ApiError::AccessDenied {
                        message: "insert policy rejected the object".to_string(),
                    })
                }
            }
        }
    }

    // ── Upload ──────────────────────────────────────────────────────

    /// Store one object: resolve the bucket, enforce its limits and the
    /// insert policy, write bytes, then commit the row.  A backend
    /// write whose metadata commit fails is cleaned up best-effort.
    pub async fn upload(
        &self,
        auth: &AuthContext,
        bucket_name: &str,
        name: &str,
        data: Bytes,
        req: UploadRequest,
    ) -> Result<UploadOutcome, ApiError> {
        Self::validate_object_name(name)?;
        let bucket = self
            .db
            .get_bucket_by_name(bucket_name)
            .await?
            .ok_or_else(|| ApiError::not_found("bucket"))?;

        let size = data.len() as u64;
        if self.max_object_size > 0 && size > self.max_object_size {
            return Err(ApiError::TooLarge {
                limit: self.max_object_size,
            });
        }
        if let Some(limit) = bucket.file_size_limit {
            if size > limit {
                return Err(ApiError::TooLarge { limit });
            }
        }

        let content_type = req
            .content_type
            .unwrap_or_else(|| mime::detect(&data, name));
        if let Some(patterns) = &bucket.allowed_mime_types {
            if !mime::is_allowed(&content_type, patterns) {
                return Err(ApiError::MimeNotAllowed { content_type });
            }
        }

        self.check_insert(
            auth,
            ProposedObject {
                bucket_id: bucket.id.clone(),
                name: name.to_string(),
                owner_id: req.owner.clone(),
            },
        )
        .await?;

        if !req.upsert && self.db.object_exists(&bucket.id, name).await? {
            return Err(ApiError::ObjectExists);
        }

        let key = Self::object_key(&bucket.id, name);
        let etag = self
            .storage
            .put(&key, data, &content_type)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;

        let now = now_rfc3339();
        let record = ObjectRecord {
            id: uuid::Uuid::new_v4().to_string(),
            bucket_id: bucket.id.clone(),
            name: name.to_string(),
            owner_id: req.owner,
            size,
            mime_type: content_type,
            etag: etag.clone(),
            user_metadata: req.user_metadata,
            path_tokens: path_tokens(name),
            created_at: now.clone(),
            updated_at: now,
            last_accessed_at: None,
        };
        let record_id = record.id.clone();

        match self.db.insert_object(record, req.upsert).await {
            Ok(true) => {}
            // Lost a same-key race: the winning row points at this key,
            // so the bytes are not orphaned and must stay.
            Ok(false) => return Err(ApiError::ObjectExists),
            Err(err) => {
                if let Err(cleanup) = self.storage.delete(&key).await {
                    if !cleanup.is_not_found() {
                        warn!(key = %key, error = %cleanup, "orphan cleanup failed");
                    }
                }
                return Err(ApiError::Internal(err));
            }
        }

        // With upsert the surviving row keeps its original id; re-read so
        // callers get the real one.
        let id = if req.upsert {
            self.db
                .get_object(&bucket.id, name, None)
                .await?
                .map(|r| r.id)
                .unwrap_or(record_id)
        } else {
            record_id
        };

        debug!(bucket = %bucket.id, object = %name, size, "object stored");
        Ok(UploadOutcome {
            key: format!("{}/{}", bucket.name, name),
            id,
            etag,
            size,
        })
    }

    // ── Read paths ──────────────────────────────────────────────────

    /// Fetch the object row with the caller's select policy applied.
    /// Denied and masked rows both read as `not_found`.
    pub async fn info(
        &self,
        auth: &AuthContext,
        bucket_name: &str,
        name: &str,
    ) -> Result<ObjectRecord, ApiError> {
        let bucket = self
            .db
            .get_bucket_by_name(bucket_name)
            .await?
            .ok_or_else(|| ApiError::not_found("bucket"))?;

        let access = self.access_for(auth, Action::Select)?;
        if matches!(access, Access::Denied) {
            return Err(ApiError::not_found("object"));
        }
        self.db
            .get_object(&bucket.id, name, access.policy())
            .await?
            .ok_or_else(|| ApiError::not_found("object"))
    }

    /// Download with row-level policy: returns the row and its bytes.
    /// `last_accessed_at` is updated asynchronously, best-effort.
    pub async fn download(
        &self,
        auth: &AuthContext,
        bucket_name: &str,
        name: &str,
    ) -> Result<(ObjectRecord, StoredContent), ApiError> {
        let record = self.info(auth, bucket_name, name).await?;
        self.fetch_bytes(record).await
    }

    /// Public download: allowed only for public buckets, no policy.
    pub async fn public_download(
        &self,
        bucket_name: &str,
        name: &str,
    ) -> Result<(ObjectRecord, StoredContent), ApiError> {
        let bucket = self
            .db
            .get_bucket_by_name(bucket_name)
            .await?
            .ok_or_else(|| ApiError::not_found("bucket"))?;
        if !bucket.public {
            return Err(ApiError::NotPublic);
        }
        let record = self
            .db
            .get_object(&bucket.id, name, None)
            .await?
            .ok_or_else(|| ApiError::not_found("object"))?;
        self.fetch_bytes(record).await
    }

    /// Download without any policy, for redeemed signed URLs.
    pub async fn signed_download(
        &self,
        bucket_name: &str,
        name: &str,
    ) -> Result<(ObjectRecord, StoredContent), ApiError> {
        let bucket = self
            .db
            .get_bucket_by_name(bucket_name)
            .await?
            .ok_or_else(|| ApiError::not_found("bucket"))?;
        let record = self
            .db
            .get_object(&bucket.id, name, None)
            .await?
            .ok_or_else(|| ApiError::not_found("object"))?;
        self.fetch_bytes(record).await
    }

    async fn fetch_bytes(
        &self,
        record: ObjectRecord,
    ) -> Result<(ObjectRecord, StoredContent), ApiError> {
        let key = Self::object_key(&record.bucket_id, &record.name);
        let content = self.storage.get(&key).await.map_err(|err| match err {
            // The row was visible, so missing bytes are a backend
            // inconsistency, not a caller error.
            BackendError::NotFound { .. } => {
                ApiError::Internal(anyhow::anyhow!("content missing for committed object {key}"))
            }
            other => ApiError::Internal(other.into()),
        })?;

        let db = self.db.clone();
        let bucket_id = record.bucket_id.clone();
        let name = record.name.clone();
        tokio::spawn(async move {
            if let Err(err) = db.touch_last_accessed(&bucket_id, &name).await {
                warn!(bucket = %bucket_id, object = %name, error = %err,
                      "failed to update last_accessed_at");
            }
        });

        Ok((record, content))
    }

    /// List object rows with the caller's select policy applied.  A
    /// denied caller sees an empty listing.
    pub async fn list(
        &self,
        auth: &AuthContext,
        bucket_name: &str,
        query: &ListObjectsQuery,
    ) -> Result<Vec<ObjectRecord>, ApiError> {
        let bucket = self
            .db
            .get_bucket_by_name(bucket_name)
            .await?
            .ok_or_else(|| ApiError::not_found("bucket"))?;

        let access = self.access_for(auth, Action::Select)?;
        if matches!(access, Access::Denied) {
            return Ok(Vec::new());
        }
        let rows = self
            .db
            .list_objects(&bucket.id, query, access.policy())
            .await?;
        Ok(rows)
    }

    // ── Delete paths ────────────────────────────────────────────────

    /// Delete one object: the metadata row goes first (under the
    /// caller's delete policy), then the bytes.  A backend that has
    /// already lost the bytes is fine.
    pub async fn delete(
        &self,
        auth: &AuthContext,
        bucket_name: &str,
        name: &str,
    ) -> Result<(), ApiError> {
        let bucket = self
            .db
            .get_bucket_by_name(bucket_name)
            .await?
            .ok_or_else(|| ApiError::not_found("bucket"))?;

        let access = self.access_for(auth, Action::Delete)?;
        if matches!(access, Access::Denied) {
            return Err(ApiError::not_found("object"));
        }
        if !self
            .db
            .delete_object(&bucket.id, name, access.policy())
            .await?
        {
            return Err(ApiError::not_found("object"));
        }

        let key = Self::object_key(&bucket.id, name);
        match self.storage.delete(&key).await {
            Ok(()) => Ok(()),
            // Deletes are idempotent; the bytes being gone already is
            // the goal state.
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(ApiError::Internal(err.into())),
        }
    }

    /// Delete many objects, applying the delete policy per path and
    /// skipping failures silently.  Returns the rows actually removed.
    pub async fn batch_delete(
        &self,
        auth: &AuthContext,
        bucket_name: &str,
        names: &[String],
    ) -> Result<Vec<ObjectRecord>, ApiError> {
        let bucket = self
            .db
            .get_bucket_by_name(bucket_name)
            .await?
            .ok_or_else(|| ApiError::not_found("bucket"))?;

        let access = self.access_for(auth, Action::Delete)?;
        if matches!(access, Access::Denied) {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        for name in names {
            // Snapshot the row first so the response can describe it.
            let record = match self.db.get_object(&bucket.id, name, access.policy()).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    debug!(object = %name, error = %err, "batch delete lookup failed");
                    continue;
                }
            };

            match self
                .db
                .delete_object(&bucket.id, name, access.policy())
                .await
            {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    debug!(object = %name, error = %err, "batch delete failed");
                    continue;
                }
            }

            let key = Self::object_key(&bucket.id, name);
            if let Err(err) = self.storage.delete(&key).await {
                if !err.is_not_found() {
                    warn!(key = %key, error = %err, "batch delete left bytes behind");
                }
            }
            removed.push(record);
        }
        Ok(removed)
    }

    // ── Copy / move ─────────────────────────────────────────────────

    /// Copy an object.  Requires select on the source and insert on the
    /// destination.  The destination must not already exist.
    #[allow(clippy::too_many_arguments)]
    pub async fn copy(
        &self,
        auth: &AuthContext,
        src_bucket_name: &str,
        src_name: &str,
        dst_bucket_name: &str,
        dst_name: &str,
        copy_metadata: bool,
        new_metadata: Option<HashMap<String, String>>,
    ) -> Result<UploadOutcome, ApiError> {
        Self::validate_object_name(dst_name)?;

        let src = self.info(auth, src_bucket_name, src_name).await?;
        let dst_bucket = self
            .db
            .get_bucket_by_name(dst_bucket_name)
            .await?
            .ok_or_else(|| ApiError::not_found("bucket"))?;

        self.check_insert(
            auth,
            ProposedObject {
                bucket_id: dst_bucket.id.clone(),
                name: dst_name.to_string(),
                owner_id: auth.user_id.clone(),
            },
        )
        .await?;

        if self.db.object_exists(&dst_bucket.id, dst_name).await? {
            return Err(ApiError::ObjectExists);
        }

        let src_key = Self::object_key(&src.bucket_id, src_name);
        let dst_key = Self::object_key(&dst_bucket.id, dst_name);
        let etag = self.storage.copy(&src_key, &dst_key).await.map_err(|err| {
            match err {
                BackendError::NotFound { .. } => ApiError::Internal(anyhow::anyhow!(
                    "content missing for committed object {src_key}"
                )),
                other => ApiError::Internal(other.into()),
            }
        })?;

        let user_metadata = if copy_metadata {
            src.user_metadata.clone()
        } else {
            new_metadata.unwrap_or_default()
        };

        let now = now_rfc3339();
        let record = ObjectRecord {
            id: uuid::Uuid::new_v4().to_string(),
            bucket_id: dst_bucket.id.clone(),
            name: dst_name.to_string(),
            owner_id: auth.user_id.clone(),
            size: src.size,
            mime_type: src.mime_type.clone(),
            etag: etag.clone(),
            user_metadata,
            path_tokens: path_tokens(dst_name),
            created_at: now.clone(),
            updated_at: now,
            last_accessed_at: None,
        };
        let id = record.id.clone();

        match self.db.insert_object(record, false).await {
            Ok(true) => {}
            Ok(false) => return Err(ApiError::ObjectExists),
            Err(err) => {
                if let Err(cleanup) = self.storage.delete(&dst_key).await {
                    if !cleanup.is_not_found() {
                        warn!(key = %dst_key, error = %cleanup, "orphan cleanup failed");
                    }
                }
                return Err(ApiError::Internal(err));
            }
        }

        Ok(UploadOutcome {
            key: format!("{}/{}", dst_bucket.name, dst_name),
            id,
            etag,
            size: src.size,
        })
    }

    /// Move an object: copy then delete the source, in that order.
    /// If the post-copy delete fails the duplicate remains and the
    /// error is surfaced.
    pub async fn r#move(
        &self,
        auth: &AuthContext,
        src_bucket_name: &str,
        src_name: &str,
        dst_bucket_name: &str,
        dst_name: &str,
    ) -> Result<UploadOutcome, ApiError> {
        let outcome = self
            .copy(
                auth,
                src_bucket_name,
                src_name,
                dst_bucket_name,
                dst_name,
                true,
                None,
            )
            .await?;
        self.delete(auth, src_bucket_name, src_name).await?;
        Ok(outcome)
    }

    // ── Metadata update ─────────────────────────────────────────────

    /// Replace an object's user metadata.  Requires the caller to see
    /// the row and to satisfy the insert predicate for it (modifying a
    /// row takes the same right as writing it).
    pub async fn update_metadata(
        &self,
        auth: &AuthContext,
        bucket_name: &str,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectRecord, ApiError> {
        let existing = self.info(auth, bucket_name, name).await?;
        self.check_insert(
            auth,
            ProposedObject {
                bucket_id: existing.bucket_id.clone(),
                name: existing.name.clone(),
                owner_id: existing.owner_id.clone(),
            },
        )
        .await?;

        if !self
            .db
            .update_object_metadata(&existing.bucket_id, name, metadata)
            .await?
        {
            return Err(ApiError::not_found("object"));
        }
        self.db
            .get_object(&existing.bucket_id, name, None)
            .await?
            .ok_or_else(|| ApiError::not_found("object"))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
