use anyhow::Result;
use clap::Parser;
use ringkv::common::Config;
use ringkv::coordinator::http::{create_router, GatewayState};
use ringkv::{MembershipView, ReplicationClient, TcpConnector};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "ringkv-gateway")]
#[command(about = "ringkv HTTP gateway - replicates requests across storage nodes")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Storage node addresses (comma separated)
    #[arg(short, long, value_delimiter = ',', required = true)]
    nodes: Vec<String>,

    /// Replication factor (overrides the config file)
    #[arg(short, long)]
    replicas: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(replicas) = args.replicas {
        config.client.replicas = replicas;
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

    tracing::info!("Starting ringkv gateway");
    tracing::info!("  HTTP API: {}", args.bind);
    tracing::info!("  Nodes: {}", args.nodes.join(", "));
    tracing::info!("  Replicas: {}", config.client.replicas);

    let client = Arc::new(ReplicationClient::new(
        config.client,
        MembershipView::fixed(args.nodes),
        TcpConnector::new(),
    )?);

    let router = create_router(GatewayState::new(client.clone()))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("✓ Gateway ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    client.close();
    Ok(())
}
