use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use meet_road::{
    cli::{self, Cli, Commands},
    config::Config,
    registry::{spawn_heartbeat_monitor, RoomRegistry},
    router, telemetry, AppState,
};

#[tokio::main]
async fn main() {
    // Default to WARN (INFO for the server itself) if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,meet_road=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        room,
        name,
        duration,
    }) = cli.command
    {
        if let Err(e) = cli::run_probe(url, room, name, duration).await {
            error!("probe error: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    if let Err(e) = serve(config).await {
        error!("server error: {e:#}");
        std::process::exit(1);
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!("Starting Meet Road signaling server on {}", config.bind_addr());
    info!(
        "Heartbeat sweep every {}s, timeout {}s",
        config.heartbeat_interval_seconds, config.heartbeat_timeout_seconds
    );

    let registry = Arc::new(RoomRegistry::new());
    let _monitor = spawn_heartbeat_monitor(
        registry.clone(),
        config.heartbeat_interval(),
        config.heartbeat_timeout(),
    );
    let state = AppState::with_registry(registry).with_metrics(telemetry::install_recorder());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Meet Road listening on {}", addr);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await
    .context("server terminated")
}
