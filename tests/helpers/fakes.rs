//! In-process stand-ins for the upstream data sources and the prober.

use async_trait::async_trait;
use coronawatch::core::{Metric, MetricsProvider, NotificationError, ReachabilityProber};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A provider whose values are set by the test.
///
/// Unknown metric/country pairs answer with an upstream error.
#[derive(Clone, Default)]
pub struct FakeProvider {
    values: Arc<Mutex<HashMap<(Metric, String), f64>>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, metric: Metric, country: &str, value: f64) {
        self.values
            .lock()
            .unwrap()
            .insert((metric, country.to_string()), value);
    }
}

#[async_trait]
impl MetricsProvider for FakeProvider {
    async fn latest_value(&self, metric: Metric, country: &str) -> Result<f64, NotificationError> {
        self.values
            .lock()
            .unwrap()
            .get(&(metric, country.to_string()))
            .copied()
            .ok_or_else(|| NotificationError::Upstream(format!("no {metric} data for {country}")))
    }
}

/// A prober that answers every URL with the same status and remembers what
/// it was asked.
#[derive(Clone)]
pub struct FixedProber {
    status: u16,
    probed: Arc<Mutex<Vec<String>>>,
}

impl FixedProber {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            probed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReachabilityProber for FixedProber {
    async fn probe(&self, url: &str) -> u16 {
        self.probed.lock().unwrap().push(url.to_string());
        self.status
    }
}
