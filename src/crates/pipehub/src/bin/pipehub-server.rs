//! Pipehub server binary
//!
//! Standalone coordination hub: binds the wire-protocol listener, opens the
//! metadata store and durable queue, and serves until SIGINT/SIGTERM.

use clap::Parser;
use pipehub::{Bucket, Database, FsBucket, Hub, HubConfig, MemoryBucket, TransactionQueue};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pipehub-server", about = "Pipeline coordination hub", version)]
struct Args {
    /// Path to a pipehub.toml configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen host (overrides config and PIPELINE_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides config and PIPELINE_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Directory holding the database, queue spool, and fs bucket
    #[arg(long, env = "PIPEHUB_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(rust_log))
        .init();

    let args = Args::parse();

    let mut config = HubConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let data_dir = args.data_dir.unwrap_or_else(HubConfig::default_data_dir);
    config.anchor_paths(&data_dir);

    let instance = uuid::Uuid::new_v4();
    tracing::info!(addr = %config.server_addr(), %instance, "starting pipehub");
    tracing::info!(path = %config.database.path.display(), "metadata store");
    tracing::info!(backend = %config.bucket.backend, "blob bucket");

    let db = Database::initialize(&config.database.path).await?;
    db.health_check().await?;

    let bucket: Arc<dyn Bucket> = match config.bucket.backend.as_str() {
        "fs" => Arc::new(FsBucket::new(&config.bucket.path)?),
        "memory" => Arc::new(MemoryBucket::new()),
        other => anyhow::bail!("unknown bucket backend: {}", other),
    };

    let queue = TransactionQueue::open(&config.queue.path)?;

    let hub = Arc::new(Hub::new(db, bucket, queue));
    hub.shutdown().install_signal_handlers();

    let listener = Hub::bind(&config.server_addr()).await?;
    hub.serve(listener).await?;

    Ok(())
}
