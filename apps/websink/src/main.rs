use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{signal, sync::watch};
use tracing::info;
use websink_rtc::WebRtcFactory;
use websink_signaling::SignalingServer;

mod config;
mod http;
mod port;
mod telemetry;

use config::{AppConfig, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = AppConfig::try_from(cli)?;
    info!(
        bind_address = %config.bind_address,
        http_port = config.http_port,
        ws_port = config.ws_port,
        codec = %config.rtc.video_codec,
        "starting websink"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: AppConfig, metrics: PrometheusHandle) -> Result<()> {
    let factory = WebRtcFactory::new(&config.rtc).context("failed to initialise webrtc engine")?;
    let server = SignalingServer::new(config.signaling(), Arc::new(factory));

    // Signaling is bound first so the HTTP fallback search skips its port.
    let ws_listener = port::bind_available(config.bind_address, config.ws_port)?;
    let http_listener = port::bind_available(config.bind_address, config.http_port)?;
    let ws_port = ws_listener.local_addr()?.port();
    let http_port = http_listener.local_addr()?.port();
    let ws_listener = port::into_async(ws_listener).context("failed to register signaling listener")?;
    let http_listener = port::into_async(http_listener).context("failed to register http listener")?;
    info!(http_port, ws_port, "websink listening");

    let count_logger = tokio::spawn(log_session_count(server.registry().subscribe_count()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let signaling = tokio::spawn({
        let server = server.clone();
        let shutdown = shutdown_rx.clone();
        async move { server.serve(ws_listener, wait_for_shutdown(shutdown)).await }
    });

    let http_state = http::HttpState::new(ws_port, server.registry().clone(), metrics);
    let router = http::router(http_state, config.static_dir.as_deref());
    let http = tokio::spawn(async move {
        axum::serve(http_listener, router)
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
            .await
    });

    shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    signaling
        .await
        .context("signaling task panicked")?
        .context("signaling server failed")?;
    http.await
        .context("http task panicked")?
        .context("http server failed")?;
    count_logger.abort();

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "viewers closed; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn log_session_count(mut count: watch::Receiver<usize>) {
    while count.changed().await.is_ok() {
        let sessions = *count.borrow_and_update();
        info!(sessions, "viewer count changed");
    }
}
