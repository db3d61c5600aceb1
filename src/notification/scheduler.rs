//! The single polling loop that decides when a webhook is due.
//!
//! Every cycle rescans the store from scratch, picks the record with the
//! earliest deadline, sleeps until that deadline, re-reads it, invokes it and,
//! if the metric moved, fans out to the sibling `ON_CHANGE` subscribers.
//! Nothing in the loop is fatal; failures are logged and the next cycle
//! starts over.
//!
//! A webhook whose invocation failed keeps its old `last_triggered`, so it
//! would win every scan. The scheduler therefore remembers a retry deadline
//! per failed id and ranks the record no earlier than that deadline.

use crate::core::{Metric, NotificationError, Trigger, Webhook, WebhookId};
use crate::notification::change_cache::ChangeCache;
use crate::notification::invoker::Invoker;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// What a single scheduler cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum Cycle {
    /// Nothing to do: the store was empty or could not be read.
    Idle,
    /// The target was delivered to; `fanned_out` siblings were invoked after it.
    Invoked {
        id: WebhookId,
        changed: bool,
        fanned_out: usize,
    },
    /// The target could not be invoked.
    Failed {
        id: WebhookId,
        error: NotificationError,
    },
    /// Shutdown was signalled while waiting.
    Shutdown,
}

/// Picks the record with the smallest `last_triggered + timeout`.
///
/// A record listed in `retry_after` is ranked at the later of its `due` and
/// its retry deadline. Ties go to whichever record the store listed first.
pub fn select_target(
    records: Vec<(WebhookId, Webhook)>,
    retry_after: &HashMap<WebhookId, DateTime<Utc>>,
) -> Option<(WebhookId, Webhook, DateTime<Utc>)> {
    let mut target: Option<(WebhookId, Webhook, DateTime<Utc>)> = None;
    for (id, webhook) in records {
        let at = match retry_after.get(&id) {
            Some(retry) => webhook.due().max(*retry),
            None => webhook.due(),
        };
        let earlier = match &target {
            Some((_, _, current)) => at < *current,
            None => true,
        };
        if earlier {
            target = Some((id, webhook, at));
        }
    }
    target
}

/// Owner of the polling loop and of the change cache.
pub struct Scheduler {
    invoker: Invoker,
    cache: ChangeCache,
    /// Earliest time a previously failed webhook may be selected again.
    retry_after: HashMap<WebhookId, DateTime<Utc>>,
    idle_interval: Duration,
    failure_backoff: Duration,
}

impl Scheduler {
    /// Creates a new `Scheduler`.
    ///
    /// # Arguments
    /// * `idle_interval` - How long to wait before rescanning when the store
    ///   is empty or unavailable.
    pub fn new(invoker: Invoker, idle_interval: Duration) -> Self {
        Self {
            invoker,
            cache: ChangeCache::new(),
            retry_after: HashMap::new(),
            idle_interval,
            failure_backoff: Duration::ZERO,
        }
    }

    /// Sets how long a failed webhook is ranked behind the others before it
    /// is retried.
    pub fn with_failure_backoff(mut self, failure_backoff: Duration) -> Self {
        self.failure_backoff = failure_backoff;
        self
    }

    /// Runs cycles until shutdown is signalled.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Webhook scheduler started.");
        while self.run_cycle(&mut shutdown_rx).await != Cycle::Shutdown {}
        info!("Webhook scheduler received shutdown signal.");
        info!("Webhook scheduler finished.");
    }

    /// Runs one select → wait → invoke → fan-out cycle.
    pub async fn run_cycle(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> Cycle {
        let records = match self.invoker.store().list_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to scan webhook store, retrying later");
                return self.idle(shutdown_rx).await;
            }
        };

        self.retry_after
            .retain(|id, _| records.iter().any(|(listed, _)| listed == id));

        let Some((id, webhook, at)) = select_target(records, &self.retry_after) else {
            debug!("No webhooks registered, waiting");
            return self.idle(shutdown_rx).await;
        };

        debug!(id = %id, due = %webhook.due(), %at, "Selected next webhook");
        if let Ok(wait) = (at - Utc::now()).to_std() {
            debug!(id = %id, wait_ms = wait.as_millis() as u64, "Waiting for webhook to become due");
            if wait_or_shutdown(wait, shutdown_rx).await {
                return Cycle::Shutdown;
            }
        }

        // The record may have been deleted or changed while we waited.
        let webhook = match self.invoker.store().get(&id).await {
            Ok(current) => current,
            Err(error) => {
                match &error {
                    NotificationError::NotFound(_) => {
                        info!(id = %id, "Webhook was deleted while waiting, skipping");
                        self.retry_after.remove(&id);
                    }
                    _ => {
                        warn!(id = %id, error = %error, "Failed to re-read webhook, skipping");
                        self.defer(&id);
                    }
                }
                return Cycle::Failed { id, error };
            }
        };

        match self.invoker.invoke(&mut self.cache, &id, &webhook).await {
            Ok(changed) => {
                self.retry_after.remove(&id);
                let fanned_out = if changed {
                    self.fan_out(webhook.metric, &id).await
                } else {
                    0
                };
                Cycle::Invoked {
                    id,
                    changed,
                    fanned_out,
                }
            }
            Err(error) => {
                match &error {
                    NotificationError::NotFound(_) => {
                        info!(id = %id, "Webhook disappeared before it could be recorded, skipping");
                        self.retry_after.remove(&id);
                    }
                    _ => {
                        warn!(id = %id, error = %error, "Webhook invocation failed");
                        self.defer(&id);
                    }
                }
                Cycle::Failed { id, error }
            }
        }
    }

    /// Invokes every `ON_CHANGE` webhook on `metric` except `triggering_id`.
    ///
    /// Returns how many of them were delivered to. Results of these
    /// invocations never cause a further fan-out.
    #[instrument(skip(self), fields(field = %metric, triggering_id = %triggering_id))]
    pub async fn fan_out(&mut self, metric: Metric, triggering_id: &WebhookId) -> usize {
        let records = match self.invoker.store().list_all().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to scan webhook store for fan-out");
                return 0;
            }
        };

        let mut delivered = 0;
        for (id, webhook) in records {
            if webhook.trigger != Trigger::OnChange
                || webhook.metric != metric
                || &id == triggering_id
            {
                continue;
            }
            match self.invoker.invoke_after_change(&mut self.cache, &id, &webhook).await {
                Ok(_) => {
                    self.retry_after.remove(&id);
                    delivered += 1;
                }
                Err(e) => warn!(id = %id, error = %e, "Fan-out invocation failed"),
            }
        }
        metrics::counter!("webhook_fanout_total").increment(delivered as u64);
        debug!(delivered, "Fan-out finished");
        delivered
    }

    /// Ranks `id` behind the other records until the failure backoff elapses.
    fn defer(&mut self, id: &WebhookId) {
        let retry = chrono::Duration::from_std(self.failure_backoff)
            .ok()
            .and_then(|backoff| Utc::now().checked_add_signed(backoff))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.retry_after.insert(id.clone(), retry);
    }

    async fn idle(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Cycle {
        if wait_or_shutdown(self.idle_interval, shutdown_rx).await {
            Cycle::Shutdown
        } else {
            Cycle::Idle
        }
    }
}

/// Sleeps for `duration`. Returns `true` if shutdown was signalled first.
async fn wait_or_shutdown(duration: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown_rx.changed() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
