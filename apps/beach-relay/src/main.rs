use anyhow::{Context, Result};
use beach_relay::{
    config::{Cli, Config},
    serve,
    telemetry::Telemetry,
    RelayState,
};
use clap::Parser;
use tokio::{net::TcpListener, signal};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init(&cli.log_filter)?;

    let config = Config::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        ice_source = config.ice.label(),
        ice_timeout_ms = config.ice_timeout.as_millis() as u64,
        outbound_buffer = config.outbound_buffer,
        "starting beach-relay"
    );

    let state = RelayState::new(config.message_router())
        .with_outbound_buffer(config.outbound_buffer)
        .with_metrics(telemetry.metrics_handle());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-relay listening on {}", config.listen_addr);

    serve(listener, state, shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
