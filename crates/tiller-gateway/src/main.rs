use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use tiller_store::Store;
use tiller_turn::{TurnCoordinator, TurnRegistry};
use tiller_upstream::client::{UpstreamClient, UpstreamConnector};

mod app;
mod http;
mod ws;

#[derive(Debug, Parser)]
#[command(name = "tiller-gateway", about = "Gateway for the upstream coding agent")]
struct Args {
    /// Path to a TOML config file; env vars override it.
    #[arg(long)]
    config: Option<String>,
    /// Listen port override.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tiller_gateway=info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = tiller_core::TillerConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }

    // A failed migration must keep the process from starting.
    let store = Arc::new(Store::open(&config.database_path)?);

    let registry = Arc::new(TurnRegistry::new());
    let upstream = Arc::new(UpstreamClient::new(
        config.upstream_url.clone(),
        config.upstream_key.clone(),
    ));
    if let Err(e) = upstream.health().await {
        warn!(error = %e, "upstream health probe failed, continuing anyway");
    }

    let connector: Arc<dyn UpstreamConnector> = upstream;
    let coordinator = Arc::new(TurnCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        connector,
        config.workspace_path(),
    ));

    let port = config.port;
    let state = Arc::new(app::AppState::new(config, store, registry, coordinator));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    info!("tiller gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
