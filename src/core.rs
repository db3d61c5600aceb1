//! Core domain types and service traits for CoronaWatch
//!
//! This module defines the webhook subscription record and the trait
//! contracts for the collaborators the notification engine talks to: the
//! document store, the upstream metrics provider, the country case reporter
//! and the reachability prober.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// The tracked quantity a webhook subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Cumulative confirmed case count.
    Confirmed,
    /// Government response stringency index.
    Stringency,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Confirmed => "confirmed",
            Metric::Stringency => "stringency",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = NotificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(Metric::Confirmed),
            "stringency" => Ok(Metric::Stringency),
            other => Err(NotificationError::InvalidField(other.to_string())),
        }
    }
}

/// When a webhook should be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    /// Fire whenever the webhook's timeout has elapsed.
    OnTimeout,
    /// Fire only when the tracked metric moved.
    OnChange,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::OnTimeout => "ON_TIMEOUT",
            Trigger::OnChange => "ON_CHANGE",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = NotificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ON_TIMEOUT" => Ok(Trigger::OnTimeout),
            "ON_CHANGE" => Ok(Trigger::OnChange),
            other => Err(NotificationError::InvalidTrigger(other.to_string())),
        }
    }
}

/// Opaque identifier assigned by the store on creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookId(String);

impl WebhookId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A subscription record, as stored and as returned over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    /// Callback endpoint that receives the metric value.
    pub url: String,
    /// Minimum number of seconds between two invocations.
    #[serde(rename = "timeout")]
    pub timeout_seconds: u64,
    #[serde(rename = "field")]
    pub metric: Metric,
    pub country: String,
    pub trigger: Trigger,
    /// Time of the most recent successful delivery.
    pub last_triggered: DateTime<Utc>,
}

impl Webhook {
    /// The instant at which this webhook becomes due again.
    pub fn due(&self) -> DateTime<Utc> {
        let timeout = Duration::from_secs(self.timeout_seconds);
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => self
                .last_triggered
                .checked_add_signed(timeout)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Err(_) => DateTime::<Utc>::MAX_UTC,
        }
    }
}

/// The body POSTed to a subscriber on every invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: WebhookId,
    pub field: Metric,
    pub country: String,
    pub value: f64,
    pub changed: bool,
    pub timestamp: DateTime<Utc>,
}

/// An inclusive date range, written `YYYY-MM-DD-YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

const DATE_FORMAT: &str = "%Y-%m-%d";

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }
}

impl FromStr for Scope {
    type Err = NotificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NotificationError::InvalidScope(s.to_string());
        // Each date is exactly ten characters, joined by a single dash.
        let (start, end) = match (s.get(..10), s.get(10..11), s.get(11..)) {
            (Some(start), Some("-"), Some(end)) => (start, end),
            _ => return Err(invalid()),
        };
        let start = NaiveDate::parse_from_str(start, DATE_FORMAT).map_err(|_| invalid())?;
        let end = NaiveDate::parse_from_str(end, DATE_FORMAT).map_err(|_| invalid())?;
        if start > end {
            return Err(invalid());
        }
        Ok(Scope { start, end })
    }
}

/// Case counts of one country over a scope, as served by `GET /country/{country}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryReport {
    pub country: String,
    pub continent: String,
    pub scope: String,
    pub confirmed: f64,
    pub recovered: f64,
    /// `confirmed / population`, rounded to two decimals.
    pub population_percentage: f64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotificationError {
    #[error("the field '{0}' does not exist")]
    InvalidField(String),

    #[error("the trigger '{0}' does not exist")]
    InvalidTrigger(String),

    #[error("the url '{url}' answered the reachability probe with status {status}")]
    UnreachableTarget { url: String, status: u16 },

    #[error("failed to parse request body: {0}")]
    InvalidBody(String),

    #[error("invalid scope '{0}', expected YYYY-MM-DD-YYYY-MM-DD covered by the case history")]
    InvalidScope(String),

    #[error("no webhook with id '{0}'")]
    NotFound(WebhookId),

    #[error("webhook store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("upstream metrics provider failed: {0}")]
    Upstream(String),
}

// =============================================================================
// Service Traits
// =============================================================================

/// Durable keyed collection of webhook records.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Persists a new record and returns its freshly assigned id.
    async fn create(&self, webhook: Webhook) -> Result<WebhookId, NotificationError>;

    /// Fetches a single record, or `NotFound`.
    async fn get(&self, id: &WebhookId) -> Result<Webhook, NotificationError>;

    /// Returns every stored record together with its id.
    async fn list_all(&self) -> Result<Vec<(WebhookId, Webhook)>, NotificationError>;

    /// Removes a record, or `NotFound`.
    async fn delete(&self, id: &WebhookId) -> Result<(), NotificationError>;

    /// Records a successful delivery at `at`. Never moves the timestamp back.
    async fn update_last_triggered(
        &self,
        id: &WebhookId,
        at: DateTime<Utc>,
    ) -> Result<(), NotificationError>;
}

/// Source of the latest value of a tracked metric.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Fetches the current value of `metric` for `country`.
    ///
    /// # Returns
    /// * `Ok(value)` with the most recent observation
    /// * `Err(NotificationError::Upstream)` if the value could not be fetched
    async fn latest_value(&self, metric: Metric, country: &str) -> Result<f64, NotificationError>;
}

/// Source of per-country case statistics.
#[async_trait]
pub trait CountryReporter: Send + Sync {
    /// Confirmed and recovered cases of `country` within `scope`, or over the
    /// whole recorded history when no scope is given.
    async fn country_report(
        &self,
        country: &str,
        scope: Option<Scope>,
    ) -> Result<CountryReport, NotificationError>;
}

/// Sanity-checks a subscriber endpoint before it is registered.
#[async_trait]
pub trait ReachabilityProber: Send + Sync {
    /// Probes `url` and returns the status code it answered with, or a
    /// client-error status if the request could not be sent.
    async fn probe(&self, url: &str) -> u16;
}
