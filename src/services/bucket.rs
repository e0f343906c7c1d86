//! Bucket service: CRUD and bucket-level constraints.

use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::ApiError;
use crate::metadata::store::{now_rfc3339, BucketPatch, BucketRecord, MetadataStore};
use crate::storage::backend::StorageBackend;

/// Bucket names that would shadow fixed object-route segments.
const RESERVED_NAMES: &[&str] = &[
    "list",
    "info",
    "copy",
    "move",
    "sign",
    "upload",
    "public",
    "authenticated",
];

/// Request to create a bucket.
#[derive(Debug, Clone, Default)]
pub struct CreateBucketRequest {
    /// Explicit id; defaults to the name.
    pub id: Option<String>,
    pub name: String,
    pub public: bool,
    pub file_size_limit: Option<u64>,
    pub allowed_mime_types: Option<Vec<String>>,
}

/// Validation struct for bucket names (kept for garde/OpenAPI tooling).
#[derive(Debug, garde::Validate)]
pub struct BucketName {
    /// Path-safe, non-empty, reasonably short.
    #[garde(length(min = 1, max = 100), pattern(r"^[^/]+$"))]
    pub name: String,
}

/// Validate a bucket name: non-empty, no slash, not a reserved route
/// segment.
pub fn validate_bucket_name(name: &str) -> Result<(), ApiError> {
    let invalid = || ApiError::InvalidName {
        name: name.to_string(),
    };

    if name.is_empty() || name.len() > 100 {
        return Err(invalid());
    }
    if name.contains('/') || name == "." || name == ".." {
        return Err(invalid());
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(invalid());
    }
    Ok(())
}

/// CRUD on buckets plus the empty/force-delete maintenance operations.
pub struct BucketService {
    db: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageBackend>,
}

impl BucketService {
    pub fn new(db: Arc<dyn MetadataStore>, storage: Arc<dyn StorageBackend>) -> Self {
        Self { db, storage }
    }

    /// Create a bucket.  The id defaults to the name; collisions on
    /// either are decided by the database.
    pub async fn create(
        &self,
        req: CreateBucketRequest,
        owner: Option<String>,
    ) -> Result<BucketRecord, ApiError> {
        validate_bucket_name(&req.name)?;
        let id = req.id.unwrap_or_else(|| req.name.clone());
        validate_bucket_name(&id)?;

        let now = now_rfc3339();
        let record = BucketRecord {
            id: id.clone(),
            name: req.name.clone(),
            owner_id: owner,
            public: req.public,
            file_size_limit: req.file_size_limit,
            allowed_mime_types: req.allowed_mime_types,
            created_at: now.clone(),
            updated_at: now,
        };

        if !self.db.create_bucket(record.clone()).await? {
            return Err(ApiError::BucketExists { bucket: req.name });
        }
        info!(bucket = %id, "bucket created");
        Ok(record)
    }

    /// Fetch a bucket by id.
    pub async fn get(&self, id: &str) -> Result<BucketRecord, ApiError> {
        self.db
            .get_bucket(id)
            .await?
            .ok_or_else(|| ApiError::not_found("bucket"))
    }

    /// Fetch a bucket by name.
    pub async fn get_by_name(&self, name: &str) -> Result<BucketRecord, ApiError> {
        self.db
            .get_bucket_by_name(name)
            .await?
            .ok_or_else(|| ApiError::not_found("bucket"))
    }

    /// List buckets name-ascending.
    pub async fn list(
        &self,
        limit: Option<u32>,
        offset: Option<u32>,
        search: Option<&str>,
    ) -> Result<Vec<BucketRecord>, ApiError> {
        let buckets = self
            .db
            .list_buckets(
                limit.unwrap_or(100),
                offset.unwrap_or(0),
                search.unwrap_or(""),
            )
            .await?;
        Ok(buckets)
    }

    /// Patch a bucket's settings and return the updated record.
    pub async fn update(&self, id: &str, patch: BucketPatch) -> Result<BucketRecord, ApiError> {
        if !self.db.update_bucket(id, patch).await? {
            return Err(ApiError::not_found("bucket"));
        }
        self.get(id).await
    }

    /// Delete a bucket.
    ///
    /// Without `force` a populated bucket is refused.  With `force` the
    /// backend bytes under the bucket prefix go first, then the
    /// metadata (object rows cascade in one transaction).
    pub async fn delete(&self, id: &str, force: bool) -> Result<(), ApiError> {
        let bucket = self.get(id).await?;

        if !force {
            let count = self.db.count_objects(&bucket.id).await?;
            if count > 0 {
                return Err(ApiError::BucketNotEmpty { bucket: bucket.id });
            }
            if !self.db.delete_bucket(&bucket.id).await? {
                return Err(ApiError::not_found("bucket"));
            }
            info!(bucket = %id, "bucket deleted");
            return Ok(());
        }

        let removed = self
            .storage
            .delete_prefix(&format!("{}/", bucket.id))
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;
        if !self.db.delete_bucket_cascade(&bucket.id).await? {
            return Err(ApiError::not_found("bucket"));
        }
        info!(bucket = %id, removed, "bucket force-deleted");
        Ok(())
    }

    /// Remove every object in the bucket; the bucket itself survives.
    pub async fn empty(&self, id: &str) -> Result<(), ApiError> {
        let bucket = self.get(id).await?;

        let removed_bytes = self
            .storage
            .delete_prefix(&format!("{}/", bucket.id))
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;
        let removed_rows = self.db.clear_bucket(&bucket.id).await?;

        if removed_bytes != removed_rows {
            warn!(
                bucket = %id,
                removed_bytes,
                removed_rows,
                "backend and metadata disagreed while emptying bucket"
            );
        }
        info!(bucket = %id, removed_rows, "bucket emptied");
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
