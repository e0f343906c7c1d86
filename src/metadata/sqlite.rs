//! SQLite-backed metadata store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.
//!
//! Policy composition: trusted predicate fragments from the policy
//! engine are appended to the WHERE clause, while every caller-supplied
//! value (auth identity, bucket id, object name, proposed row values)
//! travels through named parameters.  Fragments see the caller through
//! the `auth(user_id, email, role)` CTE and proposed rows through the
//! `new_row(bucket_id, name, owner_id)` CTE.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use rusqlite::{named_params, Connection, ErrorCode, OptionalExtension, Row};

use super::store::{
    BucketPatch, BucketRecord, ListObjectsQuery, MetadataStore, ObjectRecord, ProposedObject,
    RowPolicy, UploadSessionRecord,
};

/// Current schema version.  Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

/// Columns selected for object rows, aliased under `o`.
const OBJECT_COLUMNS: &str = "o.id, o.bucket_id, o.name, o.owner_id, o.size, o.mime_type, \
     o.etag, o.user_metadata, o.path_tokens, o.created_at, o.updated_at, o.last_accessed_at";

/// Columns selected for session rows.
const SESSION_COLUMNS: &str = "id, bucket_id, object_name, owner_id, upload_length, \
     upload_offset, content_type, cache_control, metadata, upsert, temp_key, created_at, \
     expires_at";

/// Metadata store backed by a single SQLite database file.
pub struct SqliteMetadataStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables and indexes if they do not already exist.
    /// Idempotent -- safe to call on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            -- Buckets
            CREATE TABLE IF NOT EXISTS buckets (
                id                 TEXT PRIMARY KEY,
                name               TEXT NOT NULL UNIQUE,
                owner_id           TEXT,
                public             INTEGER NOT NULL DEFAULT 0,
                file_size_limit    INTEGER,
                allowed_mime_types TEXT,
                created_at         TEXT NOT NULL,
                updated_at         TEXT NOT NULL
            );

            -- Objects
            CREATE TABLE IF NOT EXISTS objects (
                id               TEXT NOT NULL,
                bucket_id        TEXT NOT NULL,
                name             TEXT NOT NULL,
                owner_id         TEXT,
                size             INTEGER NOT NULL,
                mime_type        TEXT NOT NULL DEFAULT 'application/octet-stream',
                etag             TEXT NOT NULL,
                user_metadata    TEXT NOT NULL DEFAULT '{}',
                path_tokens      TEXT NOT NULL DEFAULT '[]',
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                last_accessed_at TEXT,

                PRIMARY KEY (bucket_id, name),
                FOREIGN KEY (bucket_id) REFERENCES buckets(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_objects_bucket
                ON objects(bucket_id);

            -- Resumable upload sessions
            CREATE TABLE IF NOT EXISTS upload_sessions (
                id            TEXT PRIMARY KEY,
                bucket_id     TEXT NOT NULL,
                object_name   TEXT NOT NULL,
                owner_id      TEXT,
                upload_length INTEGER NOT NULL,
                upload_offset INTEGER NOT NULL DEFAULT 0,
                content_type  TEXT NOT NULL DEFAULT 'application/octet-stream',
                cache_control TEXT,
                metadata      TEXT NOT NULL DEFAULT '{}',
                upsert        INTEGER NOT NULL DEFAULT 0,
                temp_key      TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                expires_at    TEXT NOT NULL,

                UNIQUE (bucket_id, object_name)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_expires
                ON upload_sessions(expires_at);
            ",
        )?;

        // Record schema version if not already present.
        let existing: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();

        if existing.is_none() || existing.unwrap() < SCHEMA_VERSION {
            let now = super::store::now_rfc3339();
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![SCHEMA_VERSION, now],
            )?;
        }

        Ok(())
    }
}

/// True when the error is a uniqueness/constraint violation.
fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn serialize_map(map: &HashMap<String, String>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

fn deserialize_map(json: &str) -> HashMap<String, String> {
    serde_json::from_str(json).unwrap_or_default()
}

fn serialize_tokens(tokens: &[String]) -> String {
    serde_json::to_string(tokens).unwrap_or_else(|_| "[]".to_string())
}

fn deserialize_tokens(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

fn serialize_mime_list(list: &Option<Vec<String>>) -> Option<String> {
    list.as_ref()
        .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string()))
}

fn deserialize_mime_list(json: Option<String>) -> Option<Vec<String>> {
    json.and_then(|j| serde_json::from_str(&j).ok())
}

fn bucket_from_row(row: &Row<'_>) -> rusqlite::Result<BucketRecord> {
    Ok(BucketRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_id: row.get(2)?,
        public: row.get::<_, i64>(3)? != 0,
        file_size_limit: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        allowed_mime_types: deserialize_mime_list(row.get(5)?),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn object_from_row(row: &Row<'_>) -> rusqlite::Result<ObjectRecord> {
    Ok(ObjectRecord {
        id: row.get(0)?,
        bucket_id: row.get(1)?,
        name: row.get(2)?,
        owner_id: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        mime_type: row.get(5)?,
        etag: row.get(6)?,
        user_metadata: deserialize_map(&row.get::<_, String>(7)?),
        path_tokens: deserialize_tokens(&row.get::<_, String>(8)?),
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        last_accessed_at: row.get(11)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<UploadSessionRecord> {
    Ok(UploadSessionRecord {
        id: row.get(0)?,
        bucket_id: row.get(1)?,
        object_name: row.get(2)?,
        owner_id: row.get(3)?,
        upload_length: row.get::<_, i64>(4)? as u64,
        upload_offset: row.get::<_, i64>(5)? as u64,
        content_type: row.get(6)?,
        cache_control: row.get(7)?,
        metadata: deserialize_map(&row.get::<_, String>(8)?),
        upsert: row.get::<_, i64>(9)? != 0,
        temp_key: row.get(10)?,
        created_at: row.get(11)?,
        expires_at: row.get(12)?,
    })
}

// ── MetadataStore implementation ───────────────────────────────────

impl MetadataStore for SqliteMetadataStore {
    // ── Buckets ─────────────────────────────────────────────────────

    fn create_bucket(
        &self,
        record: BucketRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn.execute(
                "INSERT INTO buckets
                    (id, name, owner_id, public, file_size_limit, allowed_mime_types,
                     created_at, updated_at)
                 VALUES (:id, :name, :owner_id, :public, :file_size_limit,
                         :allowed_mime_types, :created_at, :updated_at)",
                named_params! {
                    ":id": record.id,
                    ":name": record.name,
                    ":owner_id": record.owner_id,
                    ":public": record.public as i64,
                    ":file_size_limit": record.file_size_limit.map(|v| v as i64),
                    ":allowed_mime_types": serialize_mime_list(&record.allowed_mime_types),
                    ":created_at": record.created_at,
                    ":updated_at": record.updated_at,
                },
            );
            match result {
                Ok(_) => Ok(true),
                Err(err) if is_constraint_violation(&err) => Ok(false),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn get_bucket(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<BucketRecord>>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    "SELECT id, name, owner_id, public, file_size_limit, allowed_mime_types,
                            created_at, updated_at
                     FROM buckets WHERE id = ?1",
                    rusqlite::params![id],
                    bucket_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn get_bucket_by_name(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<BucketRecord>>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    "SELECT id, name, owner_id, public, file_size_limit, allowed_mime_types,
                            created_at, updated_at
                     FROM buckets WHERE name = ?1",
                    rusqlite::params![name],
                    bucket_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn list_buckets(
        &self,
        limit: u32,
        offset: u32,
        search: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<BucketRecord>>> + Send + '_>> {
        let search = search.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT id, name, owner_id, public, file_size_limit, allowed_mime_types,
                        created_at, updated_at
                 FROM buckets
                 WHERE :search = '' OR instr(name, :search) > 0
                 ORDER BY name ASC
                 LIMIT :limit OFFSET :offset",
            )?;
            let rows = stmt.query_map(
                named_params! {
                    ":search": search,
                    ":limit": limit as i64,
                    ":offset": offset as i64,
                },
                bucket_from_row,
            )?;
            let mut buckets = Vec::new();
            for row in rows {
                buckets.push(row?);
            }
            Ok(buckets)
        })
    }

    fn update_bucket(
        &self,
        id: &str,
        patch: BucketPatch,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            // NULL parameters leave the column unchanged.
            let changed = conn.execute(
                "UPDATE buckets SET
                    public = COALESCE(:public, public),
                    file_size_limit = COALESCE(:file_size_limit, file_size_limit),
                    allowed_mime_types = COALESCE(:allowed_mime_types, allowed_mime_types),
                    updated_at = :updated_at
                 WHERE id = :id",
                named_params! {
                    ":public": patch.public.map(|v| v as i64),
                    ":file_size_limit": patch.file_size_limit.map(|v| v as i64),
                    ":allowed_mime_types": serialize_mime_list(&patch.allowed_mime_types),
                    ":updated_at": super::store::now_rfc3339(),
                    ":id": id,
                },
            )?;
            Ok(changed > 0)
        })
    }

    fn delete_bucket(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let changed = conn.execute("DELETE FROM buckets WHERE id = ?1", rusqlite::params![id])?;
            Ok(changed > 0)
        })
    }

    fn delete_bucket_cascade(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM objects WHERE bucket_id = ?1",
                rusqlite::params![id],
            )?;
            let changed = tx.execute("DELETE FROM buckets WHERE id = ?1", rusqlite::params![id])?;
            tx.commit()?;
            Ok(changed > 0)
        })
    }

    fn clear_bucket(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;
            let removed = tx.execute(
                "DELETE FROM objects WHERE bucket_id = ?1",
                rusqlite::params![id],
            )?;
            tx.commit()?;
            Ok(removed as u64)
        })
    }

    fn count_objects(
        &self,
        bucket_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let bucket_id = bucket_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM objects WHERE bucket_id = ?1",
                rusqlite::params![bucket_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    // ── Objects ─────────────────────────────────────────────────────

    fn insert_object(
        &self,
        record: ObjectRecord,
        upsert: bool,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            // With upsert the existing row keeps its id and created_at.
            let conflict_clause = if upsert {
                "ON CONFLICT(bucket_id, name) DO UPDATE SET
                    owner_id = excluded.owner_id,
                    size = excluded.size,
                    mime_type = excluded.mime_type,
                    etag = excluded.etag,
                    user_metadata = excluded.user_metadata,
                    path_tokens = excluded.path_tokens,
                    updated_at = excluded.updated_at"
            } else {
                "ON CONFLICT(bucket_id, name) DO NOTHING"
            };
            let sql = format!(
                "INSERT INTO objects
                    (id, bucket_id, name, owner_id, size, mime_type, etag,
                     user_metadata, path_tokens, created_at, updated_at, last_accessed_at)
                 VALUES (:id, :bucket_id, :name, :owner_id, :size, :mime_type, :etag,
                         :user_metadata, :path_tokens, :created_at, :updated_at,
                         :last_accessed_at)
                 {conflict_clause}"
            );
            let changed = conn.execute(
                &sql,
                named_params! {
                    ":id": record.id,
                    ":bucket_id": record.bucket_id,
                    ":name": record.name,
                    ":owner_id": record.owner_id,
                    ":size": record.size as i64,
                    ":mime_type": record.mime_type,
                    ":etag": record.etag,
                    ":user_metadata": serialize_map(&record.user_metadata),
                    ":path_tokens": serialize_tokens(&record.path_tokens),
                    ":created_at": record.created_at,
                    ":updated_at": record.updated_at,
                    ":last_accessed_at": record.last_accessed_at,
                },
            )?;
            Ok(changed > 0)
        })
    }

    fn get_object(
        &self,
        bucket_id: &str,
        name: &str,
        policy: Option<&RowPolicy>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>> {
        let bucket_id = bucket_id.to_string();
        let name = name.to_string();
        let policy = policy.cloned();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = match policy {
                None => conn
                    .query_row(
                        &format!(
                            "SELECT {OBJECT_COLUMNS} FROM objects o
                             WHERE o.bucket_id = :bucket_id AND o.name = :name"
                        ),
                        named_params! { ":bucket_id": bucket_id, ":name": name },
                        object_from_row,
                    )
                    .optional()?,
                Some(p) => conn
                    .query_row(
                        &format!(
                            "WITH auth(user_id, email, role) AS
                                 (SELECT :auth_user_id, :auth_email, :auth_role)
                             SELECT {OBJECT_COLUMNS} FROM objects o, auth
                             WHERE o.bucket_id = :bucket_id AND o.name = :name
                               AND ({})",
                            p.fragment
                        ),
                        named_params! {
                            ":auth_user_id": p.user_id,
                            ":auth_email": p.email,
                            ":auth_role": p.role,
                            ":bucket_id": bucket_id,
                            ":name": name,
                        },
                        object_from_row,
                    )
                    .optional()?,
            };
            Ok(result)
        })
    }

    fn object_exists(
        &self,
        bucket_id: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let bucket_id = bucket_id.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM objects WHERE bucket_id = ?1 AND name = ?2",
                rusqlite::params![bucket_id, name],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    fn list_objects(
        &self,
        bucket_id: &str,
        query: &ListObjectsQuery,
        policy: Option<&RowPolicy>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<ObjectRecord>>> + Send + '_>> {
        let bucket_id = bucket_id.to_string();
        let query = query.clone();
        let policy = policy.cloned();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");

            let order_col = query.sort_column.as_sql();
            let order_dir = query.sort_order.as_sql();
            let base_filter = "o.bucket_id = :bucket_id
                   AND (:prefix = '' OR substr(o.name, 1, length(:prefix)) = :prefix)
                   AND (:search = '' OR instr(o.name, :search) > 0)";

            let sql = match &policy {
                None => format!(
                    "SELECT {OBJECT_COLUMNS} FROM objects o
                     WHERE {base_filter}
                     ORDER BY o.{order_col} {order_dir}
                     LIMIT :limit OFFSET :offset"
                ),
                Some(p) => format!(
                    "WITH auth(user_id, email, role) AS
                         (SELECT :auth_user_id, :auth_email, :auth_role)
                     SELECT {OBJECT_COLUMNS} FROM objects o, auth
                     WHERE {base_filter}
                       AND ({})
                     ORDER BY o.{order_col} {order_dir}
                     LIMIT :limit OFFSET :offset",
                    p.fragment
                ),
            };

            let mut stmt = conn.prepare(&sql)?;
            let mut objects = Vec::new();
            match &policy {
                None => {
                    let rows = stmt.query_map(
                        named_params! {
                            ":bucket_id": bucket_id,
                            ":prefix": query.prefix,
                            ":search": query.search,
                            ":limit": query.limit as i64,
                            ":offset": query.offset as i64,
                        },
                        object_from_row,
                    )?;
                    for row in rows {
                        objects.push(row?);
                    }
                }
                Some(p) => {
                    let rows = stmt.query_map(
                        named_params! {
                            ":auth_user_id": p.user_id,
                            ":auth_email": p.email,
                            ":auth_role": p.role,
                            ":bucket_id": bucket_id,
                            ":prefix": query.prefix,
                            ":search": query.search,
                            ":limit": query.limit as i64,
                            ":offset": query.offset as i64,
                        },
                        object_from_row,
                    )?;
                    for row in rows {
                        objects.push(row?);
                    }
                }
            }
            Ok(objects)
        })
    }

    fn delete_object(
        &self,
        bucket_id: &str,
        name: &str,
        policy: Option<&RowPolicy>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let bucket_id = bucket_id.to_string();
        let name = name.to_string();
        let policy = policy.cloned();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let changed = match policy {
                None => conn.execute(
                    "DELETE FROM objects WHERE bucket_id = :bucket_id AND name = :name",
                    named_params! { ":bucket_id": bucket_id, ":name": name },
                )?,
                // Inside the EXISTS subquery, bare column names fall
                // through to the row being deleted; `auth.*` resolves to
                // the CTE.
                Some(p) => conn.execute(
                    &format!(
                        "WITH auth(user_id, email, role) AS
                             (SELECT :auth_user_id, :auth_email, :auth_role)
                         DELETE FROM objects
                         WHERE bucket_id = :bucket_id AND name = :name
                           AND EXISTS (SELECT 1 FROM auth
                                       WHERE ({}))",
                        p.fragment
                    ),
                    named_params! {
                        ":auth_user_id": p.user_id,
                        ":auth_email": p.email,
                        ":auth_role": p.role,
                        ":bucket_id": bucket_id,
                        ":name": name,
                    },
                )?,
            };
            Ok(changed > 0)
        })
    }

    fn update_object_metadata(
        &self,
        bucket_id: &str,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let bucket_id = bucket_id.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let changed = conn.execute(
                "UPDATE objects SET user_metadata = :metadata, updated_at = :updated_at
                 WHERE bucket_id = :bucket_id AND name = :name",
                named_params! {
                    ":metadata": serialize_map(&metadata),
                    ":updated_at": super::store::now_rfc3339(),
                    ":bucket_id": bucket_id,
                    ":name": name,
                },
            )?;
            Ok(changed > 0)
        })
    }

    fn touch_last_accessed(
        &self,
        bucket_id: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let bucket_id = bucket_id.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE objects SET last_accessed_at = :now
                 WHERE bucket_id = :bucket_id AND name = :name",
                named_params! {
                    ":now": super::store::now_rfc3339(),
                    ":bucket_id": bucket_id,
                    ":name": name,
                },
            )?;
            Ok(())
        })
    }

    fn check_insert_allowed(
        &self,
        policy: &RowPolicy,
        proposed: &ProposedObject,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let policy = policy.clone();
        let proposed = proposed.clone();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let allowed: i64 = conn.query_row(
                &format!(
                    "WITH auth(user_id, email, role) AS
                         (SELECT :auth_user_id, :auth_email, :auth_role),
                     new_row(bucket_id, name, owner_id) AS
                         (SELECT :new_bucket_id, :new_name, :new_owner_id)
                     SELECT EXISTS(SELECT 1 FROM auth, new_row WHERE ({}))",
                    policy.fragment
                ),
                named_params! {
                    ":auth_user_id": policy.user_id,
                    ":auth_email": policy.email,
                    ":auth_role": policy.role,
                    ":new_bucket_id": proposed.bucket_id,
                    ":new_name": proposed.name,
                    ":new_owner_id": proposed.owner_id,
                },
                |row| row.get(0),
            )?;
            Ok(allowed != 0)
        })
    }

    // ── Upload sessions ─────────────────────────────────────────────

    fn insert_session(
        &self,
        record: UploadSessionRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn.execute(
                "INSERT INTO upload_sessions
                    (id, bucket_id, object_name, owner_id, upload_length, upload_offset,
                     content_type, cache_control, metadata, upsert, temp_key,
                     created_at, expires_at)
                 VALUES (:id, :bucket_id, :object_name, :owner_id, :upload_length,
                         :upload_offset, :content_type, :cache_control, :metadata,
                         :upsert, :temp_key, :created_at, :expires_at)",
                named_params! {
                    ":id": record.id,
                    ":bucket_id": record.bucket_id,
                    ":object_name": record.object_name,
                    ":owner_id": record.owner_id,
                    ":upload_length": record.upload_length as i64,
                    ":upload_offset": record.upload_offset as i64,
                    ":content_type": record.content_type,
                    ":cache_control": record.cache_control,
                    ":metadata": serialize_map(&record.metadata),
                    ":upsert": record.upsert as i64,
                    ":temp_key": record.temp_key,
                    ":created_at": record.created_at,
                    ":expires_at": record.expires_at,
                },
            );
            match result {
                Ok(_) => Ok(true),
                Err(err) if is_constraint_violation(&err) => Ok(false),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn get_session(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UploadSessionRecord>>> + Send + '_>>
    {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!("SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE id = ?1"),
                    rusqlite::params![id],
                    session_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn advance_session_offset(
        &self,
        id: &str,
        from_offset: u64,
        to_offset: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            // Guarded update: only advances from the offset the caller saw,
            // so the committed offset is monotonically non-decreasing.
            let changed = conn.execute(
                "UPDATE upload_sessions SET upload_offset = :to_offset
                 WHERE id = :id AND upload_offset = :from_offset",
                named_params! {
                    ":to_offset": to_offset as i64,
                    ":id": id,
                    ":from_offset": from_offset as i64,
                },
            )?;
            Ok(changed > 0)
        })
    }

    fn delete_session(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let changed = conn.execute(
                "DELETE FROM upload_sessions WHERE id = ?1",
                rusqlite::params![id],
            )?;
            Ok(changed > 0)
        })
    }

    fn list_expired_sessions(
        &self,
        now: &str,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<UploadSessionRecord>>> + Send + '_>> {
        let now = now.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM upload_sessions
                 WHERE expires_at < :now
                 ORDER BY expires_at ASC
                 LIMIT :limit"
            ))?;
            let rows = stmt.query_map(
                named_params! { ":now": now, ":limit": limit as i64 },
                session_from_row,
            )?;
            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row?);
            }
            Ok(sessions)
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::store::{now_rfc3339, path_tokens, SortColumn, SortOrder};

    fn store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(":memory:").expect("failed to create in-memory store")
    }

    fn bucket(id: &str) -> BucketRecord {
        let now = now_rfc3339();
        BucketRecord {
            id: id.to_string(),
            name: id.to_string(),
            owner_id: None,
            public: false,
            file_size_limit: None,
            allowed_mime_types: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn object(bucket_id: &str, name: &str, owner: Option<&str>) -> ObjectRecord {
        let now = now_rfc3339();
        ObjectRecord {
            id: uuid::Uuid::new_v4().to_string(),
            bucket_id: bucket_id.to_string(),
            name: name.to_string(),
            owner_id: owner.map(|s| s.to_string()),
            size: 2,
            mime_type: "text/plain".to_string(),
            etag: "49f68a5c8493ec2c0bf489821c21fc3b".to_string(),
            user_metadata: HashMap::new(),
            path_tokens: path_tokens(name),
            created_at: now.clone(),
            updated_at: now,
            last_accessed_at: None,
        }
    }

    fn owner_policy(user: &str) -> RowPolicy {
        RowPolicy {
            fragment: "owner_id = auth.user_id".to_string(),
            user_id: Some(user.to_string()),
            email: None,
            role: "authenticated".to_string(),
        }
    }

    fn session(id: &str, bucket_id: &str, name: &str, expires_at: &str) -> UploadSessionRecord {
        UploadSessionRecord {
            id: id.to_string(),
            bucket_id: bucket_id.to_string(),
            object_name: name.to_string(),
            owner_id: None,
            upload_length: 10,
            upload_offset: 0,
            content_type: "application/octet-stream".to_string(),
            cache_control: None,
            metadata: HashMap::new(),
            upsert: false,
            temp_key: format!("uploads/{id}"),
            created_at: now_rfc3339(),
            expires_at: expires_at.to_string(),
        }
    }

    // -- Buckets ---------------------------------------------------------------

    #[tokio::test]
    async fn create_bucket_and_fetch() {
        let s = store();
        assert!(s.create_bucket(bucket("photos")).await.unwrap());

        let fetched = s.get_bucket("photos").await.unwrap().unwrap();
        assert_eq!(fetched.name, "photos");
        assert!(!fetched.public);

        let by_name = s.get_bucket_by_name("photos").await.unwrap().unwrap();
        assert_eq!(by_name.id, "photos");
    }

    #[tokio::test]
    async fn duplicate_bucket_reports_collision() {
        let s = store();
        assert!(s.create_bucket(bucket("photos")).await.unwrap());
        assert!(!s.create_bucket(bucket("photos")).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_name_with_distinct_id_collides() {
        let s = store();
        assert!(s.create_bucket(bucket("photos")).await.unwrap());
        let mut other = bucket("photos2");
        other.name = "photos".to_string();
        assert!(!s.create_bucket(other).await.unwrap());
    }

    #[tokio::test]
    async fn list_buckets_sorted_and_searched() {
        let s = store();
        for id in ["zebra", "alpha", "amber"] {
            s.create_bucket(bucket(id)).await.unwrap();
        }

        let all = s.list_buckets(100, 0, "").await.unwrap();
        let names: Vec<_> = all.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "amber", "zebra"]);

        let found = s.list_buckets(100, 0, "mb").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "amber");
    }

    #[tokio::test]
    async fn update_bucket_patches_fields() {
        let s = store();
        s.create_bucket(bucket("b")).await.unwrap();

        let patch = BucketPatch {
            public: Some(true),
            file_size_limit: Some(1024),
            allowed_mime_types: Some(vec!["image/*".to_string()]),
        };
        assert!(s.update_bucket("b", patch).await.unwrap());

        let b = s.get_bucket("b").await.unwrap().unwrap();
        assert!(b.public);
        assert_eq!(b.file_size_limit, Some(1024));
        assert_eq!(b.allowed_mime_types.unwrap(), vec!["image/*"]);

        // Empty patch leaves fields alone.
        assert!(s.update_bucket("b", BucketPatch::default()).await.unwrap());
        let b = s.get_bucket("b").await.unwrap().unwrap();
        assert!(b.public);

        assert!(!s
            .update_bucket("missing", BucketPatch::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cascade_delete_removes_objects() {
        let s = store();
        s.create_bucket(bucket("b")).await.unwrap();
        s.insert_object(object("b", "a.txt", None), false)
            .await
            .unwrap();
        s.insert_object(object("b", "c.txt", None), false)
            .await
            .unwrap();

        assert!(s.delete_bucket_cascade("b").await.unwrap());
        assert!(s.get_bucket("b").await.unwrap().is_none());
        assert_eq!(s.count_objects("b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_bucket_keeps_bucket() {
        let s = store();
        s.create_bucket(bucket("b")).await.unwrap();
        s.insert_object(object("b", "a.txt", None), false)
            .await
            .unwrap();

        assert_eq!(s.clear_bucket("b").await.unwrap(), 1);
        assert!(s.get_bucket("b").await.unwrap().is_some());
        assert_eq!(s.count_objects("b").await.unwrap(), 0);
    }

    // -- Objects ---------------------------------------------------------------

    #[tokio::test]
    async fn insert_object_conflict_without_upsert() {
        let s = store();
        s.create_bucket(bucket("b")).await.unwrap();

        assert!(s
            .insert_object(object("b", "a.txt", None), false)
            .await
            .unwrap());
        assert!(!s
            .insert_object(object("b", "a.txt", None), false)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn upsert_replaces_in_place() {
        let s = store();
        s.create_bucket(bucket("b")).await.unwrap();

        let first = object("b", "a.txt", None);
        let first_id = first.id.clone();
        s.insert_object(first, false).await.unwrap();

        let mut second = object("b", "a.txt", Some("u1"));
        second.size = 99;
        second.etag = "feedface".to_string();
        assert!(s.insert_object(second, true).await.unwrap());

        let row = s.get_object("b", "a.txt", None).await.unwrap().unwrap();
        // Surrogate id and created_at survive the upsert.
        assert_eq!(row.id, first_id);
        assert_eq!(row.size, 99);
        assert_eq!(row.etag, "feedface");
        assert_eq!(row.owner_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn get_object_policy_masks_rows() {
        let s = store();
        s.create_bucket(bucket("b")).await.unwrap();
        s.insert_object(object("b", "a.txt", Some("u1")), false)
            .await
            .unwrap();

        // Owner sees the row.
        let seen = s
            .get_object("b", "a.txt", Some(&owner_policy("u1")))
            .await
            .unwrap();
        assert!(seen.is_some());

        // A different user does not.
        let masked = s
            .get_object("b", "a.txt", Some(&owner_policy("u2")))
            .await
            .unwrap();
        assert!(masked.is_none());

        // No policy sees everything.
        assert!(s.get_object("b", "a.txt", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_objects_prefix_search_sort() {
        let s = store();
        s.create_bucket(bucket("b")).await.unwrap();
        for name in ["docs/a.txt", "docs/b.txt", "img/c.png"] {
            s.insert_object(object("b", name, None), false)
                .await
                .unwrap();
        }

        let mut q = ListObjectsQuery {
            prefix: "docs/".to_string(),
            ..Default::default()
        };
        let docs = s.list_objects("b", &q, None).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].name, "docs/a.txt");

        q = ListObjectsQuery {
            search: "c.pn".to_string(),
            ..Default::default()
        };
        let found = s.list_objects("b", &q, None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "img/c.png");

        q = ListObjectsQuery {
            sort_column: SortColumn::Name,
            sort_order: SortOrder::Desc,
            ..Default::default()
        };
        let desc = s.list_objects("b", &q, None).await.unwrap();
        assert_eq!(desc[0].name, "img/c.png");

        q = ListObjectsQuery {
            limit: 1,
            offset: 1,
            ..Default::default()
        };
        let page = s.list_objects("b", &q, None).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "docs/b.txt");
    }

    #[tokio::test]
    async fn list_objects_respects_policy() {
        let s = store();
        s.create_bucket(bucket("b")).await.unwrap();
        s.insert_object(object("b", "mine.txt", Some("u1")), false)
            .await
            .unwrap();
        s.insert_object(object("b", "theirs.txt", Some("u2")), false)
            .await
            .unwrap();

        let q = ListObjectsQuery::default();
        let mine = s
            .list_objects("b", &q, Some(&owner_policy("u1")))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].name, "mine.txt");
    }

    #[tokio::test]
    async fn delete_object_respects_policy() {
        let s = store();
        s.create_bucket(bucket("b")).await.unwrap();
        s.insert_object(object("b", "a.txt", Some("u1")), false)
            .await
            .unwrap();

        // Wrong owner removes nothing.
        assert!(!s
            .delete_object("b", "a.txt", Some(&owner_policy("u2")))
            .await
            .unwrap());
        assert!(s.object_exists("b", "a.txt").await.unwrap());

        assert!(s
            .delete_object("b", "a.txt", Some(&owner_policy("u1")))
            .await
            .unwrap());
        assert!(!s.object_exists("b", "a.txt").await.unwrap());

        // Second delete reports nothing removed.
        assert!(!s.delete_object("b", "a.txt", None).await.unwrap());
    }

    #[tokio::test]
    async fn insert_predicate_checks_proposed_row() {
        let s = store();
        let policy = RowPolicy {
            fragment: "new_row.owner_id = auth.user_id".to_string(),
            user_id: Some("u1".to_string()),
            email: None,
            role: "authenticated".to_string(),
        };

        let own = ProposedObject {
            bucket_id: "b".to_string(),
            name: "a.txt".to_string(),
            owner_id: Some("u1".to_string()),
        };
        assert!(s.check_insert_allowed(&policy, &own).await.unwrap());

        let foreign = ProposedObject {
            owner_id: Some("u2".to_string()),
            ..own.clone()
        };
        assert!(!s.check_insert_allowed(&policy, &foreign).await.unwrap());
    }

    #[tokio::test]
    async fn metadata_update_and_touch() {
        let s = store();
        s.create_bucket(bucket("b")).await.unwrap();
        s.insert_object(object("b", "a.txt", None), false)
            .await
            .unwrap();

        let mut meta = HashMap::new();
        meta.insert("label".to_string(), "urgent".to_string());
        assert!(s
            .update_object_metadata("b", "a.txt", meta)
            .await
            .unwrap());

        s.touch_last_accessed("b", "a.txt").await.unwrap();

        let row = s.get_object("b", "a.txt", None).await.unwrap().unwrap();
        assert_eq!(row.user_metadata.get("label").unwrap(), "urgent");
        assert!(row.last_accessed_at.is_some());
    }

    // -- Sessions --------------------------------------------------------------

    #[tokio::test]
    async fn session_roundtrip() {
        let s = store();
        let far = "2999-01-01T00:00:00.000Z";
        assert!(s.insert_session(session("s1", "b", "a.txt", far)).await.unwrap());

        let loaded = s.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.upload_length, 10);
        assert_eq!(loaded.upload_offset, 0);
        assert_eq!(loaded.temp_key, "uploads/s1");

        assert!(s.delete_session("s1").await.unwrap());
        assert!(!s.delete_session("s1").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_session_for_same_object_collides() {
        let s = store();
        let far = "2999-01-01T00:00:00.000Z";
        assert!(s.insert_session(session("s1", "b", "a.txt", far)).await.unwrap());
        assert!(!s.insert_session(session("s2", "b", "a.txt", far)).await.unwrap());
        // Different object is fine.
        assert!(s.insert_session(session("s3", "b", "other.txt", far)).await.unwrap());
    }

    #[tokio::test]
    async fn offset_advance_is_guarded() {
        let s = store();
        let far = "2999-01-01T00:00:00.000Z";
        s.insert_session(session("s1", "b", "a.txt", far))
            .await
            .unwrap();

        assert!(s.advance_session_offset("s1", 0, 5).await.unwrap());
        // Retrying the same advance no longer matches the stored offset.
        assert!(!s.advance_session_offset("s1", 0, 5).await.unwrap());
        assert!(s.advance_session_offset("s1", 5, 10).await.unwrap());

        let loaded = s.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.upload_offset, 10);
    }

    #[tokio::test]
    async fn expired_listing_is_strict() {
        let s = store();
        s.insert_session(session("old", "b", "a.txt", "2000-01-01T00:00:00.000Z"))
            .await
            .unwrap();
        s.insert_session(session("new", "b", "b.txt", "2999-01-01T00:00:00.000Z"))
            .await
            .unwrap();

        let expired = s
            .list_expired_sessions(&now_rfc3339(), 100)
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");
    }
}
