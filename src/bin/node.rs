use anyhow::Result;
use clap::{Parser, ValueEnum};
use ringkv::common::{Config, StorageBackend};
use ringkv::NodeServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Memory,
    Rocksdb,
}

#[derive(Parser, Debug)]
#[command(name = "ringkv-node")]
#[command(about = "ringkv storage node - serves one shard of column families")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on for coordinator connections
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Storage engine
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Data directory (rocksdb backend)
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.node.bind_addr = bind;
    }
    if let Some(backend) = args.backend {
        config.node.backend = match backend {
            Backend::Memory => StorageBackend::Memory,
            Backend::Rocksdb => StorageBackend::Rocksdb,
        };
    }
    if let Some(data) = args.data {
        config.node.data_path = data;
    }
    let log_level = args.log_level.unwrap_or_else(|| config.log_level.clone());

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ringkv node {}", config.node_id);
    tracing::info!("  Listening on: {}", config.node.bind_addr);
    tracing::info!("  Backend: {:?}", config.node.backend);

    if config.node.backend == StorageBackend::Rocksdb {
        tokio::fs::create_dir_all(&config.node.data_path).await?;
        tracing::info!("  Data directory: {}", config.node.data_path.display());
    }

    let server = NodeServer::open(&config.node)?;
    let listener = tokio::net::TcpListener::bind(config.node.bind_addr).await?;

    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
