//! Delivers a single webhook invocation.

use crate::core::{
    MetricsProvider, Notification, NotificationError, Webhook, WebhookId, WebhookStore,
};
use crate::notification::change_cache::ChangeCache;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Resolves a webhook's metric, compares it against the change cache, POSTs
/// it to the subscriber and records the attempt in the store.
pub struct Invoker {
    provider: Arc<dyn MetricsProvider>,
    store: Arc<dyn WebhookStore>,
    client: reqwest::Client,
}

impl Invoker {
    /// Creates a new `Invoker`.
    ///
    /// # Arguments
    /// * `delivery_timeout` - Upper bound for a single callback POST. A
    ///   subscriber that does not answer in time counts as a failed delivery.
    pub fn new(
        provider: Arc<dyn MetricsProvider>,
        store: Arc<dyn WebhookStore>,
        delivery_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(delivery_timeout)
            .build()?;
        Ok(Self {
            provider,
            store,
            client,
        })
    }

    pub fn store(&self) -> &Arc<dyn WebhookStore> {
        &self.store
    }

    /// Invokes one webhook.
    ///
    /// # Returns
    /// * `Ok(changed)` after a successful delivery, where `changed` says
    ///   whether the metric moved since the last observation of its key
    /// * `Err(Upstream)` if the value could not be resolved; nothing is sent
    /// * `Err(DeliveryFailed)` on transport failure, timeout or non-2xx reply;
    ///   `last_triggered` is left untouched so the webhook stays due
    /// * `Err(NotFound | StoreUnavailable)` if the delivery went out but the
    ///   timestamp could not be recorded
    pub async fn invoke(
        &self,
        cache: &mut ChangeCache,
        id: &WebhookId,
        webhook: &Webhook,
    ) -> Result<bool, NotificationError> {
        self.invoke_inner(cache, id, webhook, false).await
    }

    /// Invokes a sibling `ON_CHANGE` webhook as part of a fan-out.
    ///
    /// The callback always carries `"changed": true`, since the fan-out only
    /// happens because the metric moved. The cache is still updated with the
    /// sibling's own value.
    pub async fn invoke_after_change(
        &self,
        cache: &mut ChangeCache,
        id: &WebhookId,
        webhook: &Webhook,
    ) -> Result<bool, NotificationError> {
        self.invoke_inner(cache, id, webhook, true).await
    }

    #[instrument(skip(self, cache, webhook), fields(id = %id, field = %webhook.metric, country = %webhook.country))]
    async fn invoke_inner(
        &self,
        cache: &mut ChangeCache,
        id: &WebhookId,
        webhook: &Webhook,
        fanned_out: bool,
    ) -> Result<bool, NotificationError> {
        let value = self
            .provider
            .latest_value(webhook.metric, &webhook.country)
            .await
            .inspect_err(|_| {
                metrics::counter!("webhook_invocations_total", "outcome" => "upstream_error")
                    .increment(1);
            })?;

        let changed = cache.observe(webhook.metric, &webhook.country, value) || fanned_out;
        debug!(value, changed, fanned_out, "Resolved metric value");

        let notification = Notification {
            id: id.clone(),
            field: webhook.metric,
            country: webhook.country.clone(),
            value,
            changed,
            timestamp: Utc::now(),
        };

        let start = Instant::now();
        let delivery = self.deliver(&webhook.url, &notification).await;
        metrics::histogram!("webhook_delivery_duration_seconds").record(start.elapsed().as_secs_f64());
        if let Err(e) = delivery {
            metrics::counter!("webhook_invocations_total", "outcome" => "delivery_failed")
                .increment(1);
            return Err(e);
        }

        metrics::counter!("webhook_invocations_total", "outcome" => "delivered").increment(1);
        info!(url = %webhook.url, "Delivered webhook notification");

        self.store
            .update_last_triggered(id, Utc::now())
            .await
            .inspect_err(|e| warn!(error = %e, "Delivered, but failed to record last_triggered"))?;

        Ok(changed)
    }

    async fn deliver(&self, url: &str, notification: &Notification) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(url)
            .json(notification)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotificationError::DeliveryFailed(format!("request to {url} timed out"))
                } else {
                    NotificationError::DeliveryFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::DeliveryFailed(format!(
                "{url} responded with status {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Metric, Trigger};
    use crate::store::DocumentStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use std::sync::Mutex;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Returns queued values in order, repeating the last one.
    struct QueuedProvider {
        values: Mutex<Vec<Result<f64, NotificationError>>>,
    }

    impl QueuedProvider {
        fn new(values: Vec<Result<f64, NotificationError>>) -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(values),
            })
        }
    }

    #[async_trait]
    impl MetricsProvider for QueuedProvider {
        async fn latest_value(&self, _metric: Metric, _country: &str) -> Result<f64, NotificationError> {
            let mut values = self.values.lock().unwrap();
            if values.len() > 1 {
                values.remove(0)
            } else {
                values[0].clone()
            }
        }
    }

    fn webhook(url: String, last_triggered: DateTime<Utc>) -> Webhook {
        Webhook {
            url,
            timeout_seconds: 0,
            metric: Metric::Confirmed,
            country: "Norway".to_string(),
            trigger: Trigger::OnChange,
            last_triggered,
        }
    }

    async fn setup(
        provider: Arc<QueuedProvider>,
        url: String,
    ) -> (Invoker, Arc<DocumentStore>, WebhookId, Webhook) {
        let store = Arc::new(DocumentStore::in_memory());
        let record = webhook(url, Utc::now() - ChronoDuration::hours(1));
        let id = store.create(record.clone()).await.unwrap();
        let invoker = Invoker::new(provider, store.clone(), Duration::from_millis(500)).unwrap();
        (invoker, store, id, record)
    }

    #[tokio::test]
    async fn test_successful_delivery_updates_last_triggered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "field": "confirmed",
                "country": "Norway",
                "value": 100.0,
                "changed": true
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let provider = QueuedProvider::new(vec![Ok(100.0)]);
        let (invoker, store, id, record) = setup(provider, format!("{}/hook", server.uri())).await;
        let mut cache = ChangeCache::new();

        let changed = invoker.invoke(&mut cache, &id, &record).await.unwrap();

        assert!(changed);
        assert!(store.get(&id).await.unwrap().last_triggered > record.last_triggered);
    }

    #[tokio::test]
    async fn test_same_value_twice_reports_no_change() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(2)
            .mount(&server)
            .await;

        let provider = QueuedProvider::new(vec![Ok(7.0)]);
        let (invoker, _store, id, record) = setup(provider, format!("{}/hook", server.uri())).await;
        let mut cache = ChangeCache::new();

        assert!(invoker.invoke(&mut cache, &id, &record).await.unwrap());
        assert!(!invoker.invoke(&mut cache, &id, &record).await.unwrap());
    }

    #[tokio::test]
    async fn test_server_error_leaves_last_triggered_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = QueuedProvider::new(vec![Ok(1.0)]);
        let (invoker, store, id, record) = setup(provider, format!("{}/hook", server.uri())).await;
        let mut cache = ChangeCache::new();

        let result = invoker.invoke(&mut cache, &id, &record).await;

        assert!(matches!(result, Err(NotificationError::DeliveryFailed(_))));
        assert_eq!(
            store.get(&id).await.unwrap().last_triggered,
            record.last_triggered
        );
    }

    #[tokio::test]
    async fn test_hung_subscriber_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(2)))
            .mount(&server)
            .await;

        let provider = QueuedProvider::new(vec![Ok(1.0)]);
        let (invoker, store, id, record) = setup(provider, format!("{}/hook", server.uri())).await;
        let mut cache = ChangeCache::new();

        let result = invoker.invoke(&mut cache, &id, &record).await;

        assert!(matches!(result, Err(NotificationError::DeliveryFailed(_))));
        assert_eq!(
            store.get(&id).await.unwrap().last_triggered,
            record.last_triggered
        );
    }

    #[tokio::test]
    async fn test_upstream_failure_skips_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let provider = QueuedProvider::new(vec![Err(NotificationError::Upstream(
            "offline".to_string(),
        ))]);
        let (invoker, _store, id, record) = setup(provider, format!("{}/hook", server.uri())).await;
        let mut cache = ChangeCache::new();

        let result = invoker.invoke(&mut cache, &id, &record).await;

        assert_eq!(
            result,
            Err(NotificationError::Upstream("offline".to_string()))
        );
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_record_deleted_after_delivery_reports_not_found() {
        let server = MockServer::start().await;
        let provider = QueuedProvider::new(vec![Ok(1.0)]);
        let (invoker, store, id, record) = setup(provider, format!("{}/hook", server.uri())).await;

        // The subscriber removes its own webhook while handling the callback.
        let deleting_store = store.clone();
        let deleting_id = id.clone();
        Mock::given(method("POST"))
            .respond_with(move |_: &wiremock::Request| {
                let store = deleting_store.clone();
                let id = deleting_id.clone();
                std::thread::spawn(move || {
                    tokio::runtime::Runtime::new()
                        .unwrap()
                        .block_on(async move { store.delete(&id).await.unwrap() })
                })
                .join()
                .unwrap();
                ResponseTemplate::new(200)
            })
            .expect(1)
            .mount(&server)
            .await;
        let mut cache = ChangeCache::new();

        let result = invoker.invoke(&mut cache, &id, &record).await;

        assert_eq!(result, Err(NotificationError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_fan_out_delivery_always_reports_change() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "changed": true })))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let provider = QueuedProvider::new(vec![Ok(5.0)]);
        let (invoker, _store, id, record) = setup(provider, format!("{}/hook", server.uri())).await;
        let mut cache = ChangeCache::new();
        cache.observe(Metric::Confirmed, "Norway", 5.0);

        assert!(invoker.invoke_after_change(&mut cache, &id, &record).await.unwrap());
        assert!(invoker.invoke_after_change(&mut cache, &id, &record).await.unwrap());
    }
}
