//! Common metrics snapshot shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Point-in-time numeric view of one component instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentMetrics {
    /// Component kind: `rate_limiter`, `circuit_breaker`, `worker_pool`, ...
    pub component: String,
    /// Instance name; breakers use their configured name.
    pub name: String,
    /// Unix seconds at capture.
    pub captured_at_unix: u64,
    pub gauges: BTreeMap<String, f64>,
}

impl ComponentMetrics {
    pub fn new(component: &str, name: &str, captured_at_unix: u64) -> Self {
        Self {
            component: component.to_string(),
            name: name.to_string(),
            captured_at_unix,
            gauges: BTreeMap::new(),
        }
    }

    pub fn gauge(mut self, key: &str, value: f64) -> Self {
        self.gauges.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.gauges.get(key).copied()
    }
}

/// Anything that can report a [`ComponentMetrics`] snapshot on demand.
pub trait Observable: Send + Sync {
    fn observe(&self) -> Vec<ComponentMetrics>;
}
