//! Document store for webhook records.
//!
//! `DocumentStore` keeps every record in memory behind a `tokio` `RwLock`
//! and, when given a path, mirrors the whole collection to a JSON snapshot
//! after each mutation so that registrations survive a restart.

use crate::core::{NotificationError, Webhook, WebhookId, WebhookStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

const ID_LENGTH: usize = 20;
const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    /// Every id ever handed out, including deleted ones.
    issued: HashSet<WebhookId>,
    /// Live records in insertion order.
    webhooks: Vec<StoredWebhook>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredWebhook {
    id: WebhookId,
    #[serde(flatten)]
    webhook: Webhook,
}

/// The default `WebhookStore` implementation.
pub struct DocumentStore {
    inner: RwLock<Snapshot>,
    path: Option<PathBuf>,
}

impl DocumentStore {
    /// Creates an empty store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Snapshot::default()),
            path: None,
        }
    }

    /// Opens a store backed by the JSON snapshot at `path`, creating it on
    /// the first write if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read webhook store {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse webhook store {}", path.display()))?
        } else {
            Snapshot::default()
        };
        info!(
            path = %path.display(),
            webhooks = snapshot.webhooks.len(),
            "Opened webhook store"
        );
        Ok(Self {
            inner: RwLock::new(snapshot),
            path: Some(path),
        })
    }

    fn generate_id(issued: &HashSet<WebhookId>) -> WebhookId {
        let mut rng = rand::rng();
        loop {
            let id: String = (0..ID_LENGTH)
                .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
                .collect();
            let id = WebhookId::new(id);
            if !issued.contains(&id) {
                return id;
            }
        }
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), NotificationError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| NotificationError::StoreUnavailable(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| NotificationError::StoreUnavailable(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| NotificationError::StoreUnavailable(e.to_string()))?;
        debug!(path = %path.display(), "Persisted webhook store");
        Ok(())
    }
}

#[async_trait]
impl WebhookStore for DocumentStore {
    #[instrument(skip_all)]
    async fn create(&self, webhook: Webhook) -> Result<WebhookId, NotificationError> {
        let mut inner = self.inner.write().await;
        let id = Self::generate_id(&inner.issued);
        inner.issued.insert(id.clone());
        inner.webhooks.push(StoredWebhook {
            id: id.clone(),
            webhook,
        });
        if let Err(e) = self.persist(&inner).await {
            inner.webhooks.pop();
            return Err(e);
        }
        metrics::gauge!("webhooks_registered").set(inner.webhooks.len() as f64);
        Ok(id)
    }

    async fn get(&self, id: &WebhookId) -> Result<Webhook, NotificationError> {
        let inner = self.inner.read().await;
        inner
            .webhooks
            .iter()
            .find(|stored| &stored.id == id)
            .map(|stored| stored.webhook.clone())
            .ok_or_else(|| NotificationError::NotFound(id.clone()))
    }

    async fn list_all(&self) -> Result<Vec<(WebhookId, Webhook)>, NotificationError> {
        let inner = self.inner.read().await;
        Ok(inner
            .webhooks
            .iter()
            .map(|stored| (stored.id.clone(), stored.webhook.clone()))
            .collect())
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn delete(&self, id: &WebhookId) -> Result<(), NotificationError> {
        let mut inner = self.inner.write().await;
        let position = inner
            .webhooks
            .iter()
            .position(|stored| &stored.id == id)
            .ok_or_else(|| NotificationError::NotFound(id.clone()))?;
        let removed = inner.webhooks.remove(position);
        if let Err(e) = self.persist(&inner).await {
            inner.webhooks.insert(position, removed);
            return Err(e);
        }
        metrics::gauge!("webhooks_registered").set(inner.webhooks.len() as f64);
        Ok(())
    }

    async fn update_last_triggered(
        &self,
        id: &WebhookId,
        at: DateTime<Utc>,
    ) -> Result<(), NotificationError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .webhooks
            .iter_mut()
            .find(|stored| &stored.id == id)
            .ok_or_else(|| NotificationError::NotFound(id.clone()))?;
        if at <= stored.webhook.last_triggered {
            return Ok(());
        }
        let previous = stored.webhook.last_triggered;
        stored.webhook.last_triggered = at;
        if let Err(e) = self.persist(&inner).await {
            if let Some(stored) = inner.webhooks.iter_mut().find(|stored| &stored.id == id) {
                stored.webhook.last_triggered = previous;
            }
            return Err(e);
        }
        Ok(())
    }
}
