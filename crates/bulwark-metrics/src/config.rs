use std::time::Duration;

use bulwark_core::duration::human;
use bulwark_core::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Time between collections.
    #[serde(with = "human")]
    pub interval: Duration,
    /// Emit one `info` line per component on every collection.
    pub log_snapshots: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            log_snapshots: true,
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        ConfigError::ensure(!self.interval.is_zero(), "metrics.interval", "must be greater than zero")
    }
}
