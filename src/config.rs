//! Configuration loading and types for pailstore.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, authentication, metadata persistence, object
//! storage, resumable uploads, and row-level policy enforcement.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication settings (JWT secret and API keys).
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metadata database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Object storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Resumable upload settings.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Row-level policy settings.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probes).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config must deserialize")
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum object size in bytes accepted by direct uploads (default 5 GiB).
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            max_object_size: default_max_object_size(),
        }
    }
}

/// Authentication settings.
///
/// `jwt_secret` signs inbound access tokens and the outbound signed URLs;
/// it must be at least 32 bytes.  `anon_key` and `service_key` are opaque
/// API keys mapped to the `anon` and `service_role` roles respectively.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for JWT verification and URL signing (>= 32 bytes).
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// API key granting the anonymous role.
    #[serde(default = "default_anon_key")]
    pub anon_key: String,

    /// API key granting the service role (policy bypass).
    #[serde(default = "default_service_key")]
    pub service_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            anon_key: default_anon_key(),
            service_key: default_service_key(),
        }
    }
}

/// Metadata database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file (`":memory:"` for tests).
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Object storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `local`, `s3`, or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Local storage configuration.
    #[serde(default)]
    pub local: LocalStorageConfig,

    /// S3-compatible gateway configuration.
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            local: LocalStorageConfig::default(),
            s3: None,
        }
    }
}

/// Local filesystem storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for stored objects.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
        }
    }
}

/// S3-compatible gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    /// Backing bucket name.
    pub bucket: String,
    /// Region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Key prefix in the backing bucket.
    #[serde(default)]
    pub prefix: String,
    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
}

/// Resumable upload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Maximum declared length of a resumable upload in bytes (0 = unlimited).
    #[serde(default)]
    pub max_size: u64,

    /// Lifetime of an upload session in seconds.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,

    /// Interval between expiry sweeps in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_size: 0,
            session_ttl_seconds: default_session_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// Row-level policy configuration.
///
/// When enabled, every object read, insert, and delete is constrained by
/// the SQL predicate configured for the caller's role.  A role with no
/// entry (or an empty fragment) is denied.  Service-role callers bypass
/// enforcement entirely.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PolicyConfig {
    /// Whether policy enforcement is active for object rows.
    #[serde(default)]
    pub enabled: bool,

    /// Per-role predicate fragments.
    #[serde(default)]
    pub roles: HashMap<String, RolePolicyConfig>,
}

/// Predicate fragments for one role.
///
/// Fragments are trusted SQL.  They may reference the `auth(user_id,
/// email, role)` relation, object columns, and (for insert) the
/// `new_row(bucket_id, name, owner_id)` relation.  They must never embed
/// request values directly.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RolePolicyConfig {
    /// Predicate applied to reads.
    #[serde(default)]
    pub select: String,

    /// Predicate checked against proposed rows on upload.
    #[serde(default)]
    pub insert: String,

    /// Predicate applied to deletes.
    #[serde(default)]
    pub delete: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
///
/// Controls Prometheus metrics collection and Kubernetes-style health
/// probes.  Both are enabled by default.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable `/healthz` and `/readyz` probes, and deep `/health` checks.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9504
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_object_size() -> u64 {
    5_368_709_120 // 5 GiB
}

fn default_jwt_secret() -> String {
    // Development-only default; deployments must override.
    "pailstore-development-signing-secret!!".to_string()
}

fn default_anon_key() -> String {
    "pailstore-anon".to_string()
}

fn default_service_key() -> String {
    "pailstore-service".to_string()
}

fn default_database_path() -> String {
    "./data/metadata.db".to_string()
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_session_ttl() -> u64 {
    86_400 // 24 hours
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
