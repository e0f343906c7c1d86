//! pailstore library -- self-hostable object storage engine.
//!
//! This crate provides the storage subsystem of a self-hostable
//! backend-as-a-service: bucket and object management over a pluggable
//! byte-store backend, SQL-backed metadata, row-level access policies,
//! signed URLs, and TUS-style resumable uploads.

use std::sync::Arc;

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metadata;
pub mod metrics;
pub mod mime;
pub mod policy;
pub mod server;
pub mod services;
pub mod storage;
pub mod token;

use crate::config::Config;
use crate::metadata::store::MetadataStore;
use crate::policy::{ConfigPolicyEngine, PolicyEngine};
use crate::services::bucket::BucketService;
use crate::services::object::ObjectService;
use crate::services::resumable::ResumableUploadService;
use crate::storage::backend::StorageBackend;
use crate::token::TokenCodec;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Metadata store (SQLite).
    pub db: Arc<dyn MetadataStore>,
    /// Byte-store backend (local filesystem, S3 gateway, or memory).
    pub storage: Arc<dyn StorageBackend>,
    /// Bucket CRUD.
    pub buckets: BucketService,
    /// Object I/O.
    pub objects: Arc<ObjectService>,
    /// Resumable upload sessions.
    pub uploads: Arc<ResumableUploadService>,
    /// Signed-URL codec.
    pub tokens: TokenCodec,
}

impl AppState {
    /// Wire the service graph over a metadata store and byte backend.
    pub fn build(
        config: Config,
        db: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageBackend>,
    ) -> anyhow::Result<Self> {
        let policy: Arc<dyn PolicyEngine> = Arc::new(ConfigPolicyEngine::new(&config.policy));
        let tokens = TokenCodec::new(&config.auth.jwt_secret)?;
        let objects = Arc::new(ObjectService::new(
            db.clone(),
            storage.clone(),
            policy,
            config.server.max_object_size,
        ));
        let buckets = BucketService::new(db.clone(), storage.clone());
        let uploads = Arc::new(ResumableUploadService::new(
            db.clone(),
            storage.clone(),
            objects.clone(),
            config.upload.max_size,
            config.upload.session_ttl_seconds,
        ));
        Ok(Self {
            config,
            db,
            storage,
            buckets,
            objects,
            uploads,
            tokens,
        })
    }
}
