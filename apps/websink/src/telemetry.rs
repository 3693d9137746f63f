use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        describe_metrics();
        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

fn describe_metrics() {
    describe_gauge!(
        "websink_sessions_active",
        "Viewer sessions currently registered"
    );
    describe_counter!(
        "websink_handshakes_total",
        "Viewer handshakes by outcome"
    );
    describe_counter!("websink_offers_sent_total", "SDP offers delivered to viewers");
    describe_counter!(
        "websink_ice_candidates_forwarded_total",
        "Local ICE candidates relayed to viewers"
    );
    describe_counter!(
        "websink_messages_dropped_total",
        "Viewer messages discarded, by reason"
    );
    describe_counter!(
        "websink_peer_connections_lost_total",
        "Sessions closed because their media transport was lost"
    );
    describe_counter!(
        "websink_engine_failures_total",
        "WebRTC engine operations that failed, by operation"
    );
}
