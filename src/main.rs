//! Crashline server binary
//!
//! Runs the round loop and serves the HTTP/WebSocket API until Ctrl+C,
//! then lets the round in flight finish and settle before exiting.

use clap::Parser;
use crashline::{
    api::{shutdown_signal, ApiServer},
    config::{ConfigLoader, StorageBackend},
    orchestrator::RoundOrchestrator,
    store,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crashline")]
#[command(about = "Multiplayer crash game server", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Database directory (overrides storage.data_directory)
    #[arg(long)]
    db_path: Option<String>,

    /// Keep all state in memory; nothing survives a restart
    #[arg(long)]
    memory: bool,

    /// API server host
    #[arg(long)]
    host: Option<String>,

    /// API server port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;

    if let Some(db_path) = args.db_path {
        config.storage.data_directory = db_path;
        config.storage.backend = StorageBackend::RocksDb;
    }
    if args.memory {
        config.storage.backend = StorageBackend::Memory;
    }
    if let Some(host) = args.host {
        config.api.host = host;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.monitoring.log_filter)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.storage.backend,
        data_directory = %config.storage.data_directory,
        "Starting crashline"
    );

    let store = store::open(&config.storage)?;
    let orchestrator = RoundOrchestrator::from_config(config.clone(), store).await?;
    let (game, engine) = orchestrator.spawn();

    let server = ApiServer::new(config.api.clone(), game.clone());
    server.run(shutdown_signal()).await?;

    game.stop();
    info!("Waiting for the round in flight to settle");
    match engine.await {
        Ok(Ok(())) => info!("Engine stopped"),
        Ok(Err(e)) => error!(error = %e, "Engine stopped with an error"),
        Err(e) => error!(error = %e, "Engine task failed"),
    }

    Ok(())
}
