use std::time::Duration;

use bulwark_core::duration::human;
use bulwark_core::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Queue capacity; submissions beyond it fail with `QueueFull`.
    pub queue_size: usize,
    /// Shutdown grace for in-flight jobs that carry no timeout of their own.
    #[serde(with = "human")]
    pub worker_timeout: Duration,
    /// Queue utilization above which a worker is added.
    pub scale_up_threshold: f64,
    /// Queue utilization below which an idle worker is retired.
    pub scale_down_threshold: f64,
    #[serde(with = "human")]
    pub scale_up_cooldown: Duration,
    #[serde(with = "human")]
    pub scale_down_cooldown: Duration,
    #[serde(with = "human")]
    pub health_check_interval: Duration,
    #[serde(with = "human")]
    pub metrics_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 3,
            max_workers: 20,
            queue_size: 500,
            worker_timeout: Duration::from_secs(30),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(180),
            health_check_interval: Duration::from_secs(15),
            metrics_interval: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        ConfigError::ensure(self.min_workers > 0, "pool.min_workers", "must be at least 1")?;
        ConfigError::ensure(
            self.max_workers >= self.min_workers,
            "pool.max_workers",
            "must be at least min_workers",
        )?;
        ConfigError::ensure(self.queue_size > 0, "pool.queue_size", "must be at least 1")?;
        for (field, value) in [
            ("pool.scale_up_threshold", self.scale_up_threshold),
            ("pool.scale_down_threshold", self.scale_down_threshold),
        ] {
            ConfigError::ensure((0.0..=1.0).contains(&value), field, "must be within [0, 1]")?;
        }
        ConfigError::ensure(
            self.scale_down_threshold < self.scale_up_threshold,
            "pool.scale_down_threshold",
            "must be below scale_up_threshold",
        )?;
        ConfigError::ensure(
            !self.health_check_interval.is_zero(),
            "pool.health_check_interval",
            "must be greater than zero",
        )?;
        ConfigError::ensure(
            !self.metrics_interval.is_zero(),
            "pool.metrics_interval",
            "must be greater than zero",
        )
    }
}
