//! pailstore -- self-hostable object storage service.
//!
//! Startup is crash-only: schema init is idempotent and every startup
//! doubles as recovery.  SIGTERM/SIGINT stop accepting connections,
//! signal the expiry sweeper to exit, and wait for in-flight requests.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

/// Command-line arguments for the pailstore server.
#[derive(Parser, Debug)]
#[command(
    name = "pailstore",
    version,
    about = "Self-hostable object storage service"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "pailstore.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = pailstore::config::load_config(&cli.config)?;

    // Initialize tracing from config (RUST_LOG wins when set).
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // Initialize Prometheus metrics.
    if config.observability.metrics {
        pailstore::metrics::init_metrics();
        pailstore::metrics::describe_metrics();
        info!("prometheus metrics initialized");
    }

    // Metadata store (SQLite).
    let db_path = &config.database.path;
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db: Arc<dyn pailstore::metadata::store::MetadataStore> =
        Arc::new(pailstore::metadata::sqlite::SqliteMetadataStore::new(db_path)?);
    info!("sqlite metadata store initialized at {}", db_path);

    // Byte-store backend.
    let storage: Arc<dyn pailstore::storage::backend::StorageBackend> =
        match config.storage.backend.as_str() {
            "s3" => {
                let s3_config = config.storage.s3.as_ref().ok_or_else(|| {
                    anyhow::anyhow!(
                        "storage.backend is 's3' but the storage.s3 config section is missing"
                    )
                })?;
                Arc::new(pailstore::storage::s3::S3GatewayBackend::new(s3_config).await?)
            }
            "memory" => {
                info!("memory storage backend initialized (contents are ephemeral)");
                Arc::new(pailstore::storage::memory::MemoryBackend::new())
            }
            _ => {
                let root = &config.storage.local.root_dir;
                let backend = pailstore::storage::local::LocalBackend::new(root)?;
                info!("local storage backend initialized at {}", root);
                Arc::new(backend)
            }
        };

    let sweep_interval = config.upload.sweep_interval_seconds;
    let state = Arc::new(pailstore::AppState::build(config, db, storage)?);

    // Background expiry sweeper with clean shutdown.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(
        state
            .uploads
            .clone()
            .run_sweeper(sweep_interval, shutdown_rx),
    );

    let app = pailstore::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("pailstore listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the sweeper and wait for it to wind down.
    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;

    info!("pailstore shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        },
    }
}
