use std::time::Duration;

use bulwark_core::duration::human;
use bulwark_core::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u64,
    /// Completed probes required before a half-open breaker may close.
    pub success_threshold: u64,
    #[serde(with = "human")]
    pub timeout_threshold: Duration,
    #[serde(with = "human")]
    pub open_timeout: Duration,
    /// Longest a breaker may stay half-open; zero disables the limit.
    #[serde(with = "human")]
    pub half_open_timeout: Duration,
    pub half_open_max_requests: u64,
    pub half_open_success_ratio: f64,
    #[serde(with = "human")]
    pub reset_timeout: Duration,
    #[serde(with = "human")]
    pub monitoring_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_threshold: Duration::from_secs(30),
            open_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
            half_open_success_ratio: 1.0,
            reset_timeout: Duration::from_secs(60),
            monitoring_interval: Duration::from_secs(10),
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        ConfigError::ensure(self.failure_threshold > 0, "failure_threshold", "must be at least 1")?;
        ConfigError::ensure(self.success_threshold > 0, "success_threshold", "must be at least 1")?;
        ConfigError::ensure(
            self.half_open_max_requests > 0,
            "half_open_max_requests",
            "must be at least 1",
        )?;
        ConfigError::ensure(
            self.half_open_success_ratio > 0.0 && self.half_open_success_ratio <= 1.0,
            "half_open_success_ratio",
            "must be in (0, 1]",
        )?;
        ConfigError::ensure(
            !self.timeout_threshold.is_zero(),
            "timeout_threshold",
            "must be greater than zero",
        )?;
        ConfigError::ensure(
            !self.reset_timeout.is_zero(),
            "reset_timeout",
            "must be greater than zero",
        )?;
        ConfigError::ensure(
            !self.monitoring_interval.is_zero(),
            "monitoring_interval",
            "must be greater than zero",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        BreakerConfig::default().validate().unwrap();
    }

    #[test]
    fn ratio_out_of_range_is_rejected() {
        let config = BreakerConfig {
            half_open_success_ratio: 1.5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("half_open_success_ratio"));
    }

    #[test]
    fn parses_durations() {
        let config: BreakerConfig = toml::from_str(
            r#"
            failure_threshold = 3
            open_timeout = "500ms"
            half_open_timeout = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.open_timeout, Duration::from_millis(500));
        assert!(config.half_open_timeout.is_zero());
        assert_eq!(config.success_threshold, 3);
    }
}
