use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Process-wide logging and metrics. Holds the handle `/metrics` renders from.
pub struct Telemetry {
    metrics: PrometheusHandle,
}

impl Telemetry {
    /// Install the Prometheus recorder and the tracing subscriber. `RUST_LOG` wins over
    /// `default_filter` when both are set. Fails if called twice in one process.
    pub fn init(default_filter: &str) -> Result<Self> {
        let metrics = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_relay_metrics();

        tracing_subscriber::registry()
            .with(log_filter(default_filter)?)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        Ok(Self { metrics })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics.clone()
    }
}

fn log_filter(default_filter: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_filter)
            .with_context(|| format!("invalid log filter: {default_filter}")),
    }
}

fn describe_relay_metrics() {
    describe_counter!("beach_relay_connections_total", "WebSocket connections accepted");
    describe_counter!(
        "beach_relay_connections_rejected_total",
        "Connections refused at registration, by reason"
    );
    describe_gauge!("beach_relay_connections_active", "Currently registered connections");
    describe_counter!(
        "beach_relay_envelopes_forwarded_total",
        "Envelopes handed to a peer's outbound queue, by type"
    );
    describe_counter!(
        "beach_relay_envelopes_dropped_total",
        "Inbound envelopes discarded, by reason"
    );
    describe_counter!(
        "beach_relay_byes_synthesized_total",
        "bye notices sent on behalf of a closed connection"
    );
    describe_counter!(
        "beach_relay_ice_fallbacks_total",
        "ICE lookups answered from the fallback list, by reason"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn configured_filter_is_validated() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(log_filter("beach_relay=debug,tower_http=warn").is_ok());
        assert!(log_filter("beach_relay=notalevel").is_err());
    }
}
