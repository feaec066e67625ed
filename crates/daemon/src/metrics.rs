//! In-process counters for the relay's observability trail

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Named monotonic counters
#[derive(Clone, Default)]
pub struct Metrics {
    counters: Arc<DashMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, name: &str) {
        *self.counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    /// Stable snapshot for logging/export
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}
