//! Registration of new webhook subscriptions.
//!
//! Incoming request bodies carry `field` and `trigger` as raw strings so that
//! an unknown value can be reported as the specific validation error instead
//! of a generic deserialisation failure.

use crate::core::{
    Metric, NotificationError, ReachabilityProber, Trigger, Webhook, WebhookId, WebhookStore,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

/// The body of a `POST /notifications` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub url: String,
    pub timeout: u64,
    pub field: String,
    pub country: String,
    pub trigger: String,
}

/// Checks a registration request and turns it into a storable record.
///
/// `field` and `trigger` are checked first; the reachability probe is only
/// sent for requests that are otherwise well-formed. The store is never
/// touched.
pub async fn validate(
    request: &WebhookRequest,
    prober: &dyn ReachabilityProber,
) -> Result<Webhook, NotificationError> {
    let metric: Metric = request.field.parse()?;
    let trigger: Trigger = request.trigger.parse()?;

    let status = prober.probe(&request.url).await;
    if !(200..300).contains(&status) {
        warn!(url = %request.url, status, "Webhook target failed reachability probe");
        return Err(NotificationError::UnreachableTarget {
            url: request.url.clone(),
            status,
        });
    }

    Ok(Webhook {
        url: request.url.clone(),
        timeout_seconds: request.timeout,
        metric,
        country: request.country.clone(),
        trigger,
        last_triggered: Utc::now(),
    })
}

/// Validates, probes and persists a new webhook.
#[instrument(skip_all, fields(url = %request.url, field = %request.field))]
pub async fn register(
    request: &WebhookRequest,
    prober: &dyn ReachabilityProber,
    store: &dyn WebhookStore,
) -> Result<WebhookId, NotificationError> {
    let webhook = match validate(request, prober).await {
        Ok(webhook) => webhook,
        Err(e) => {
            metrics::counter!("webhook_registrations_total", "outcome" => "rejected").increment(1);
            return Err(e);
        }
    };

    let id = store.create(webhook).await.inspect_err(|_| {
        metrics::counter!("webhook_registrations_total", "outcome" => "store_error").increment(1);
    })?;
    metrics::counter!("webhook_registrations_total", "outcome" => "created").increment(1);
    info!(id = %id, "Registered webhook");
    Ok(id)
}
