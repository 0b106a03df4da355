//! The daemon's TOML file: one section per component.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use bulwark_autoscale::AutoScalerConfig;
use bulwark_breaker::BreakerConfig;
use bulwark_chaos::ChaosConfig;
use bulwark_metrics::MetricsConfig;
use bulwark_pool::PoolConfig;
use bulwark_ratelimit::RateLimitConfig;
use serde::{Deserialize, Serialize};

/// Every section is optional; missing ones take component defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulwarkConfig {
    pub pool: PoolConfig,
    /// Breaker name → settings.
    pub breakers: BTreeMap<String, BreakerConfig>,
    pub rate_limiter: RateLimitConfig,
    pub chaos: ChaosConfig,
    pub autoscaler: AutoScalerConfig,
    pub metrics: MetricsConfig,
}

impl BulwarkConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text).context("parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("load config {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.pool.validate()?;
        for (name, breaker) in &self.breakers {
            breaker
                .validate()
                .with_context(|| format!("breakers.{name}"))?;
        }
        self.rate_limiter.validate()?;
        self.chaos.validate()?;
        self.autoscaler.validate()?;
        self.metrics.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    const SAMPLE: &str = include_str!("../bulwark.toml");

    #[test]
    fn empty_file_takes_defaults() {
        let config = BulwarkConfig::parse("").unwrap();
        assert_eq!(config, BulwarkConfig::default());
    }

    #[test]
    fn sample_config_is_valid() {
        let config = BulwarkConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.pool.min_workers, 2);
        assert!(config.breakers.contains_key("upstream"));
        assert_eq!(config.autoscaler.scale_up_cooldown, Duration::from_secs(120));
        assert!(config.autoscaler.custom_metrics.contains_key("queue_depth"));
        assert!(config.chaos.scenarios.contains_key("slow_checkout"));
    }

    #[test]
    fn invalid_breaker_names_the_section() {
        let err = BulwarkConfig::parse(
            r#"
            [breakers.payments]
            failure_threshold = 0
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("breakers.payments"));
    }

    #[test]
    fn unknown_section_is_rejected() {
        assert!(BulwarkConfig::parse("[scheduler]\nenabled = true\n").is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[metrics]\ninterval = \"5s\"").unwrap();
        let config = BulwarkConfig::load(file.path()).unwrap();
        assert_eq!(config.metrics.interval, Duration::from_secs(5));
    }

    #[test]
    fn missing_file_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = BulwarkConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("absent.toml"));
    }
}
