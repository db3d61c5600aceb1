//! Test helpers for running the full application instance.

use super::fakes::{FakeProvider, FixedProber};
use anyhow::Result;
use coronawatch::{
    app::App,
    config::Config,
    core::{ReachabilityProber, WebhookStore},
    store::DocumentStore,
};
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::timeout};

/// A running application bound to an ephemeral port.
pub struct TestApp {
    pub addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
    pub store: Arc<dyn WebhookStore>,
    pub provider: FakeProvider,
    pub client: reqwest::Client,
    task_manager: coronawatch::task_manager::TaskManager,
    app_handle: JoinHandle<Result<()>>,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Registers a webhook through the API and returns its id.
    pub async fn register(&self, body: Value) -> Result<String> {
        let response = self
            .client
            .post(self.url("/notifications"))
            .json(&body)
            .send()
            .await?;
        anyhow::ensure!(
            response.status() == reqwest::StatusCode::CREATED,
            "registration failed with {}",
            response.status()
        );
        let created: Value = response.json().await?;
        Ok(created["id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("response carried no id"))?
            .to_string())
    }

    /// Shuts down the application and waits for it to terminate.
    /// Fails if the application does not shut down within the specified timeout.
    pub async fn shutdown(self, timeout_duration: Duration) -> Result<()> {
        self.task_manager.trigger_shutdown();
        match timeout(timeout_duration, self.app_handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(anyhow::anyhow!("App failed to shut down within the timeout")),
        }
    }
}

/// A builder for creating `TestApp` instances with specific configurations.
pub struct TestAppBuilder {
    pub config: Config,
    provider: FakeProvider,
    prober: Arc<dyn ReachabilityProber>,
    store: Option<Arc<dyn WebhookStore>>,
}

impl TestAppBuilder {
    pub fn new() -> Self {
        let mut config = Config::default();
        config.server.listen_address = SocketAddr::from(([127, 0, 0, 1], 0));
        config.scheduler.idle_interval_seconds = 1;
        config.scheduler.failure_backoff_ms = 50;
        config.delivery.timeout_ms = 2_000;

        Self {
            config,
            provider: FakeProvider::new(),
            prober: Arc::new(FixedProber::new(200)),
            store: None,
        }
    }

    pub fn with_provider(mut self, provider: FakeProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn ReachabilityProber>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn WebhookStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config_modifier(mut self, modifier: impl FnOnce(&mut Config)) -> Self {
        modifier(&mut self.config);
        self
    }

    pub async fn build(self) -> Result<TestApp> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(DocumentStore::in_memory()));
        let app = App::builder(self.config)
            .store_override(store.clone())
            .provider_override(Arc::new(self.provider.clone()))
            .prober_override(self.prober)
            .build()
            .await?;

        let addr = app.api_addr();
        let metrics_addr = app.metrics_addr();
        let task_manager = app.task_manager();
        let app_handle = tokio::spawn(app.run());

        Ok(TestApp {
            addr,
            metrics_addr,
            store,
            provider: self.provider,
            client: reqwest::Client::new(),
            task_manager,
            app_handle,
        })
    }
}
