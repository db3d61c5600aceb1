//! Last observed value per tracked `(metric, country)` pair.

use crate::core::Metric;
use std::collections::HashMap;

/// Decides whether a metric moved since the previous poll.
///
/// Owned exclusively by the scheduler loop, so it takes `&mut self` and needs
/// no locking. It is never persisted: after a restart the first observation
/// of every key counts as a change.
#[derive(Debug, Default)]
pub struct ChangeCache {
    last_seen: HashMap<(Metric, String), f64>,
}

impl ChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` for `(metric, country)`.
    ///
    /// # Returns
    /// * `true` if the key was unseen or the value differs from the stored one
    /// * `false` if the value is identical to the previous observation
    pub fn observe(&mut self, metric: Metric, country: &str, value: f64) -> bool {
        let key = (metric, country.to_string());
        match self.last_seen.get(&key) {
            Some(previous) if *previous == value => false,
            _ => {
                self.last_seen.insert(key, value);
                true
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}
