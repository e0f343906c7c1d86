//! Abstract metadata store trait.
//!
//! Any metadata backend must implement [`MetadataStore`].  The trait
//! uses manual desugaring with pinned futures so it can be used with
//! both SQLite and future remote stores.
//!
//! Conflict-sensitive inserts (`create_bucket`, `insert_object`,
//! `insert_session`) report uniqueness violations as `Ok(false)` so the
//! database, not a read-then-write race, decides the winner.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Current time as an RFC-3339 string with fixed millisecond precision
/// (e.g., "2026-08-01T12:00:00.000Z").  The fixed width keeps stored
/// timestamps lexicographically comparable.
pub fn now_rfc3339() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Derive path tokens from an object name: split on `/`, empties dropped.
pub fn path_tokens(name: &str) -> Vec<String> {
    name.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

// ── Record types ───────────────────────────────────────────────────

/// Metadata record for a bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketRecord {
    /// Unique bucket id.
    pub id: String,
    /// Unique bucket name (defaults to the id).
    pub name: String,
    /// Opaque owner reference, if any.
    pub owner_id: Option<String>,
    /// Whether unauthenticated downloads are allowed.
    pub public: bool,
    /// Per-object size cap in bytes (None = unlimited).
    pub file_size_limit: Option<u64>,
    /// Allowed MIME glob patterns (None = any).
    pub allowed_mime_types: Option<Vec<String>>,
    /// RFC-3339 creation timestamp.
    pub created_at: String,
    /// RFC-3339 last-update timestamp.
    pub updated_at: String,
}

/// Metadata record for a stored object.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectRecord {
    /// Surrogate id.
    pub id: String,
    /// Owning bucket id.
    pub bucket_id: String,
    /// Slash-delimited object path, unique within the bucket.
    pub name: String,
    /// Opaque owner reference, if any.
    pub owner_id: Option<String>,
    /// Content length in bytes.
    pub size: u64,
    /// MIME content type.
    pub mime_type: String,
    /// Hex MD5 of the content.
    pub etag: String,
    /// User-defined metadata.
    pub user_metadata: HashMap<String, String>,
    /// `name` split on `/`, used by policy predicates.
    pub path_tokens: Vec<String>,
    /// RFC-3339 creation timestamp.
    pub created_at: String,
    /// RFC-3339 last-update timestamp.
    pub updated_at: String,
    /// RFC-3339 last-download timestamp, if any.
    pub last_accessed_at: Option<String>,
}

/// Metadata record for an in-progress resumable upload.
#[derive(Debug, Clone)]
pub struct UploadSessionRecord {
    /// Session id (128-bit random, hex).
    pub id: String,
    /// Destination bucket id.
    pub bucket_id: String,
    /// Destination object path.
    pub object_name: String,
    /// Owner the finalized object is attributed to.
    pub owner_id: Option<String>,
    /// Declared total length in bytes.
    pub upload_length: u64,
    /// Bytes persisted so far.
    pub upload_offset: u64,
    /// Content type of the finalized object.
    pub content_type: String,
    /// Cache-Control of the finalized object, if any.
    pub cache_control: Option<String>,
    /// User-defined metadata for the finalized object.
    pub metadata: HashMap<String, String>,
    /// Whether finalize may overwrite an existing object.
    pub upsert: bool,
    /// Backend key holding the staging bytes.
    pub temp_key: String,
    /// RFC-3339 creation timestamp.
    pub created_at: String,
    /// RFC-3339 expiry timestamp.
    pub expires_at: String,
}

// ── Policy filter types ────────────────────────────────────────────

/// A trusted SQL predicate from the policy engine plus the auth values
/// it may reference through the `auth(user_id, email, role)` relation.
///
/// The store materializes `auth` as a parameter-bound CTE; the fragment
/// itself never carries request data.
#[derive(Debug, Clone)]
pub struct RowPolicy {
    /// Trusted SQL boolean fragment.  Never empty: deny-by-default is
    /// resolved before the store is reached.
    pub fragment: String,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub role: String,
}

/// Proposed values an INSERT predicate is checked against, exposed to
/// fragments as the `new_row(bucket_id, name, owner_id)` relation.
#[derive(Debug, Clone)]
pub struct ProposedObject {
    pub bucket_id: String,
    pub name: String,
    pub owner_id: Option<String>,
}

// ── List query types ───────────────────────────────────────────────

/// Sortable object columns (whitelist; never interpolate caller input).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortColumn {
    #[default]
    Name,
    CreatedAt,
    UpdatedAt,
    LastAccessedAt,
}

impl SortColumn {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortColumn::Name => "name",
            SortColumn::CreatedAt => "created_at",
            SortColumn::UpdatedAt => "updated_at",
            SortColumn::LastAccessedAt => "last_accessed_at",
        }
    }

    /// Parse a wire column name; unknown names fall back to `name`.
    pub fn parse(s: &str) -> Self {
        match s {
            "created_at" => SortColumn::CreatedAt,
            "updated_at" => SortColumn::UpdatedAt,
            "last_accessed_at" => SortColumn::LastAccessedAt,
            _ => SortColumn::Name,
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("desc") {
            SortOrder::Desc
        } else {
            SortOrder::Asc
        }
    }
}

/// Parameters for listing objects in a bucket.
#[derive(Debug, Clone)]
pub struct ListObjectsQuery {
    /// Only names starting with this prefix.
    pub prefix: String,
    /// Only names containing this substring.
    pub search: String,
    pub limit: u32,
    pub offset: u32,
    pub sort_column: SortColumn,
    pub sort_order: SortOrder,
}

impl Default for ListObjectsQuery {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            search: String::new(),
            limit: 100,
            offset: 0,
            sort_column: SortColumn::default(),
            sort_order: SortOrder::default(),
        }
    }
}

/// Fields updatable on a bucket.  `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct BucketPatch {
    pub public: Option<bool>,
    pub file_size_limit: Option<u64>,
    pub allowed_mime_types: Option<Vec<String>>,
}

// ── Trait ──────────────────────────────────────────────────────────

/// Async metadata store contract.
pub trait MetadataStore: Send + Sync + 'static {
    // ── Buckets ─────────────────────────────────────────────────────

    /// Create a bucket record.  Returns `false` on id or name collision.
    fn create_bucket(
        &self,
        record: BucketRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Get a bucket by id.
    fn get_bucket(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<BucketRecord>>> + Send + '_>>;

    /// Get a bucket by name.
    fn get_bucket_by_name(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<BucketRecord>>> + Send + '_>>;

    /// List buckets name-ascending, with optional substring search.
    fn list_buckets(
        &self,
        limit: u32,
        offset: u32,
        search: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<BucketRecord>>> + Send + '_>>;

    /// Apply a patch to a bucket.  Returns `false` if the bucket is absent.
    fn update_bucket(
        &self,
        id: &str,
        patch: BucketPatch,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Delete a bucket row only.  Returns `false` if absent.
    fn delete_bucket(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Delete a bucket and all its object rows in one transaction.
    fn delete_bucket_cascade(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Delete all object rows in a bucket (the bucket survives).
    /// Returns the number of rows removed.
    fn clear_bucket(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;

    /// Count objects in a bucket.
    fn count_objects(
        &self,
        bucket_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;

    // ── Objects ─────────────────────────────────────────────────────

    /// Insert an object row.  With `upsert` an existing `(bucket, name)`
    /// row is replaced in place (id and created_at survive); without it,
    /// a collision returns `false`.
    fn insert_object(
        &self,
        record: ObjectRecord,
        upsert: bool,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Get one object row, constrained by the select policy if present.
    /// A row masked by the policy reads as absent.
    fn get_object(
        &self,
        bucket_id: &str,
        name: &str,
        policy: Option<&RowPolicy>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>>;

    /// Check raw existence of an object row (no policy).
    fn object_exists(
        &self,
        bucket_id: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// List object rows, constrained by the select policy if present.
    fn list_objects(
        &self,
        bucket_id: &str,
        query: &ListObjectsQuery,
        policy: Option<&RowPolicy>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<ObjectRecord>>> + Send + '_>>;

    /// Delete one object row, constrained by the delete policy if
    /// present.  Returns `false` when no row was removed (absent or
    /// masked).
    fn delete_object(
        &self,
        bucket_id: &str,
        name: &str,
        policy: Option<&RowPolicy>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Replace an object's user metadata and bump `updated_at`.
    fn update_object_metadata(
        &self,
        bucket_id: &str,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Set `last_accessed_at` to now.  Fire-and-forget callers tolerate
    /// failure.
    fn touch_last_accessed(
        &self,
        bucket_id: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Evaluate an insert predicate against proposed row values.
    fn check_insert_allowed(
        &self,
        policy: &RowPolicy,
        proposed: &ProposedObject,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    // ── Upload sessions ─────────────────────────────────────────────

    /// Insert a session row.  Returns `false` when another live session
    /// already targets the same `(bucket, object)`.
    fn insert_session(
        &self,
        record: UploadSessionRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Get a session by id.
    fn get_session(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UploadSessionRecord>>> + Send + '_>>;

    /// Advance a session's offset from `from_offset` to `to_offset`.
    /// Returns `false` when the stored offset no longer equals
    /// `from_offset`; offsets only ever grow.
    fn advance_session_offset(
        &self,
        id: &str,
        from_offset: u64,
        to_offset: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Delete a session row.  Returns `false` if absent.
    fn delete_session(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// List sessions whose `expires_at` is strictly before `now`.
    fn list_expired_sessions(
        &self,
        now: &str,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<UploadSessionRecord>>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_tokens_splits_and_drops_empties() {
        assert_eq!(path_tokens("a/b/c.txt"), vec!["a", "b", "c.txt"]);
        assert_eq!(path_tokens("/a//b/"), vec!["a", "b"]);
        assert!(path_tokens("").is_empty());
    }

    #[test]
    fn now_is_fixed_width() {
        let now = now_rfc3339();
        // "YYYY-MM-DDTHH:MM:SS.mmmZ"
        assert_eq!(now.len(), 24);
        assert!(now.ends_with('Z'));
    }

    #[test]
    fn sort_column_whitelist() {
        assert_eq!(SortColumn::parse("created_at"), SortColumn::CreatedAt);
        assert_eq!(SortColumn::parse("; DROP TABLE"), SortColumn::Name);
        assert_eq!(SortOrder::parse("DESC"), SortOrder::Desc);
        assert_eq!(SortOrder::parse("sideways"), SortOrder::Asc);
    }
}
