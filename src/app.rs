//! The main application logic, decoupled from the entry point.

use crate::{
    api::{self, ApiState},
    config::Config,
    core::{CountryReporter, MetricsProvider, ReachabilityProber, WebhookStore},
    corona::{CoronaApiClient, HttpProber},
    internal_metrics::{self, MetricsBuilder},
    notification::{Invoker, Scheduler},
    store::DocumentStore,
    task_manager::TaskManager,
};
use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc, time::Duration, time::Instant};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument};

/// How long running tasks get to finish after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A handle to the running application.
pub struct App {
    task_manager: TaskManager,
    api_addr: SocketAddr,
    metrics_addr: Option<SocketAddr>,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    /// The address the HTTP API is bound to.
    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    /// A handle that can trigger shutdown from elsewhere (e.g. a signal handler).
    pub fn task_manager(&self) -> TaskManager {
        self.task_manager.clone()
    }

    /// Waits for the shutdown signal and then gracefully shuts down all tasks.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.task_manager.subscribe();
        while !*shutdown_rx.borrow_and_update() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        info!("Shutdown signal received. Waiting for tasks to complete...");
        self.task_manager.shutdown(SHUTDOWN_GRACE).await;
        Ok(())
    }
}

/// Builder for the main application.
///
/// Components that talk to the outside world can be overridden, which is how
/// the integration tests run the full app against fakes.
pub struct AppBuilder {
    config: Config,
    store_override: Option<Arc<dyn WebhookStore>>,
    provider_override: Option<Arc<dyn MetricsProvider>>,
    prober_override: Option<Arc<dyn ReachabilityProber>>,
}

impl AppBuilder {
    /// Creates a new `AppBuilder` with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store_override: None,
            provider_override: None,
            prober_override: None,
        }
    }

    /// Overrides the webhook store.
    pub fn store_override(mut self, store: Arc<dyn WebhookStore>) -> Self {
        self.store_override = Some(store);
        self
    }

    /// Overrides the upstream metrics provider.
    pub fn provider_override(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.provider_override = Some(provider);
        self
    }

    /// Overrides the reachability prober.
    pub fn prober_override(mut self, prober: Arc<dyn ReachabilityProber>) -> Self {
        self.prober_override = Some(prober);
        self
    }

    /// Builds all components, binds the listeners and spawns the HTTP API and
    /// the scheduler.
    #[instrument(skip_all)]
    pub async fn build(self) -> Result<App> {
        let config = self.config;
        let task_manager = TaskManager::new();

        // =========================================================================
        // 1. External collaborators
        // =========================================================================
        let store: Arc<dyn WebhookStore> = match self.store_override {
            Some(store) => store,
            None => match &config.store.path {
                Some(path) => Arc::new(DocumentStore::open(path)?),
                None => {
                    info!("No store path configured; webhooks are kept in memory only");
                    Arc::new(DocumentStore::in_memory())
                }
            },
        };

        let upstream = Arc::new(CoronaApiClient::new(&config.upstream)?);
        let provider: Arc<dyn MetricsProvider> = match self.provider_override {
            Some(provider) => provider,
            None => upstream.clone(),
        };
        let reporter: Arc<dyn CountryReporter> = upstream;

        let prober: Arc<dyn ReachabilityProber> = match self.prober_override {
            Some(prober) => prober,
            None => Arc::new(HttpProber::new(Duration::from_millis(
                config.delivery.probe_timeout_ms,
            ))?),
        };

        // Bind before spawning anything so a taken port fails the build cleanly.
        let listener = TcpListener::bind(config.server.listen_address)
            .await
            .with_context(|| {
                format!(
                    "failed to bind HTTP API to {}",
                    config.server.listen_address
                )
            })?;
        let api_addr = listener.local_addr()?;

        // =========================================================================
        // 2. Metrics
        // =========================================================================
        let metrics_addr = match MetricsBuilder::new(config.metrics.clone())
            .build(task_manager.subscribe())
            .await?
        {
            Some((server, addr)) => {
                task_manager.spawn("MetricsServer", server.run());
                Some(addr)
            }
            None => {
                internal_metrics::describe();
                None
            }
        };

        // =========================================================================
        // 3. Scheduler
        // =========================================================================
        let invoker = Invoker::new(
            provider,
            store.clone(),
            Duration::from_millis(config.delivery.timeout_ms),
        )?;
        let scheduler = Scheduler::new(
            invoker,
            Duration::from_secs(config.scheduler.idle_interval_seconds),
        )
        .with_failure_backoff(Duration::from_millis(config.scheduler.failure_backoff_ms));
        debug!(
            idle_interval_seconds = config.scheduler.idle_interval_seconds,
            failure_backoff_ms = config.scheduler.failure_backoff_ms,
            "Initializing scheduler"
        );
        task_manager.spawn("Scheduler", scheduler.run(task_manager.subscribe()));

        // =========================================================================
        // 4. HTTP API
        // =========================================================================
        let router = api::router(ApiState {
            store,
            prober,
            reporter,
            upstream: config.upstream.clone(),
            started: Instant::now(),
        });
        task_manager.spawn("HttpApi", api::serve(listener, router, task_manager.subscribe()));

        info!(%api_addr, "CoronaWatch initialized successfully.");

        Ok(App {
            task_manager,
            api_addr,
            metrics_addr,
        })
    }
}
