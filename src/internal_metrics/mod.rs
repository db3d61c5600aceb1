//! # Internal Metrics Module
//!
//! Metrics are recorded through the `metrics` facade macros at the call
//! sites. When the exporter is enabled, `MetricsBuilder` installs a
//! Prometheus recorder and prepares the `MetricsServer` that serves
//! `/metrics`; otherwise the macros are no-ops.

pub mod server;

use crate::config::MetricsConfig;
use crate::internal_metrics::server::MetricsServer;
use anyhow::{Context, Result};
use metrics::Unit;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// Registers descriptions for every metric the application records.
pub fn describe() {
    metrics::describe_counter!(
        "webhook_invocations_total",
        Unit::Count,
        "Webhook invocations, labeled by outcome (delivered, delivery_failed, upstream_error)."
    );
    metrics::describe_counter!(
        "webhook_fanout_total",
        Unit::Count,
        "ON_CHANGE webhooks delivered to as part of a fan-out."
    );
    metrics::describe_counter!(
        "webhook_registrations_total",
        Unit::Count,
        "Registration attempts, labeled by outcome (created, rejected, store_error)."
    );
    metrics::describe_histogram!(
        "webhook_delivery_duration_seconds",
        Unit::Seconds,
        "Time taken by a single callback POST."
    );
    metrics::describe_gauge!(
        "webhooks_registered",
        Unit::Count,
        "Number of webhooks currently stored."
    );
}

/// Builder for the metrics system.
pub struct MetricsBuilder {
    config: MetricsConfig,
}

impl MetricsBuilder {
    /// Creates a new `MetricsBuilder` with the given configuration.
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    /// Installs the Prometheus recorder and binds the metrics listener.
    ///
    /// Returns `None` when metrics are disabled in the configuration.
    pub async fn build(
        self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Option<(MetricsServer, SocketAddr)>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )?
            .build_recorder();
        let handle = recorder.handle();

        let listener = TcpListener::bind(self.config.listen_address)
            .await
            .with_context(|| {
                format!(
                    "failed to bind metrics server to {}",
                    self.config.listen_address
                )
            })?;
        let addr = listener.local_addr()?;

        metrics::set_global_recorder(recorder)
            .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
        describe();
        info!(%addr, "Prometheus exporter enabled");

        Ok(Some((MetricsServer::new(listener, handle, shutdown_rx), addr)))
    }
}
