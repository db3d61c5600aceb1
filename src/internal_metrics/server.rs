//! # Metrics Server
//!
//! An `axum` server with a single `/metrics` endpoint that renders the
//! Prometheus exposition format. It stops when the shutdown signal fires.

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, trace};

/// A server that exposes metrics to a Prometheus scraper.
pub struct MetricsServer {
    listener: TcpListener,
    prom_handle: PrometheusHandle,
    shutdown_rx: watch::Receiver<bool>,
}

impl MetricsServer {
    /// Creates a new `MetricsServer` but does not spawn it.
    pub fn new(
        listener: TcpListener,
        prom_handle: PrometheusHandle,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            prom_handle,
            shutdown_rx,
        }
    }

    /// Returns a future that runs the server until a shutdown signal is received.
    pub fn run(self) -> impl Future<Output = ()> {
        let prom_handle = self.prom_handle;
        let app = Router::new().route(
            "/metrics",
            get(move || {
                let prom_handle = prom_handle.clone();
                async move { prom_handle.render() }
            }),
        );
        let listener = self.listener;
        let mut shutdown_rx = self.shutdown_rx;

        async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
                trace!("Metrics server received shutdown signal.");
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Metrics server error: {}", e);
            }
            trace!("Metrics server task finished.");
        }
    }
}
