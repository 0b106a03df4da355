use std::collections::BTreeMap;
use std::time::Duration;

use bulwark_core::duration::human;
use bulwark_core::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
    #[default]
    Both,
}

impl ScaleDirection {
    pub fn allows_up(self) -> bool {
        matches!(self, Self::Up | Self::Both)
    }
}

/// A caller-reported metric that can drive the replica count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomMetric {
    pub target_value: f64,
    pub weight: f64,
    pub scale_direction: ScaleDirection,
}

impl Default for CustomMetric {
    fn default() -> Self {
        Self {
            target_value: 1.0,
            weight: 1.0,
            scale_direction: ScaleDirection::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionAlgorithm {
    /// Least-squares line over the window.
    #[default]
    Linear,
    /// Smoothed level plus the gap between it and the latest sample.
    Exponential,
}

impl PredictionAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Exponential => "exponential",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub algorithm: PredictionAlgorithm,
    pub window_size: usize,
    #[serde(with = "human")]
    pub horizon: Duration,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self::cpu()
    }
}

impl PredictorConfig {
    pub fn cpu() -> Self {
        Self {
            algorithm: PredictionAlgorithm::Linear,
            window_size: 100,
            horizon: Duration::from_secs(600),
        }
    }

    pub fn memory() -> Self {
        Self {
            algorithm: PredictionAlgorithm::Exponential,
            window_size: 50,
            horizon: Duration::from_secs(300),
        }
    }
}

fn default_memory_predictor() -> PredictorConfig {
    PredictorConfig::memory()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorSet {
    #[serde(default)]
    pub cpu: PredictorConfig,
    #[serde(default = "default_memory_predictor")]
    pub memory: PredictorConfig,
}

impl Default for PredictorSet {
    fn default() -> Self {
        Self {
            cpu: PredictorConfig::cpu(),
            memory: PredictorConfig::memory(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScalerConfig {
    pub enabled: bool,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub target_cpu_utilization: f64,
    pub target_memory_utilization: f64,
    #[serde(with = "human")]
    pub scale_up_cooldown: Duration,
    #[serde(with = "human")]
    pub scale_down_cooldown: Duration,
    /// Readings older than this are ignored by the evaluator.
    #[serde(with = "human")]
    pub metrics_window: Duration,
    #[serde(with = "human")]
    pub evaluation_interval: Duration,
    #[serde(with = "human")]
    pub metrics_log_interval: Duration,
    pub predictive_scaling: bool,
    /// Pending actions kept before the oldest is dropped.
    pub action_queue_size: usize,
    pub custom_metrics: BTreeMap<String, CustomMetric>,
    pub predictors: PredictorSet,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_replicas: 2,
            max_replicas: 20,
            target_cpu_utilization: 0.7,
            target_memory_utilization: 0.8,
            scale_up_cooldown: Duration::from_secs(120),
            scale_down_cooldown: Duration::from_secs(300),
            metrics_window: Duration::from_secs(300),
            evaluation_interval: Duration::from_secs(30),
            metrics_log_interval: Duration::from_secs(60),
            predictive_scaling: true,
            action_queue_size: 100,
            custom_metrics: BTreeMap::new(),
            predictors: PredictorSet::default(),
        }
    }
}

impl AutoScalerConfig {
    pub fn cooldown(&self, up: bool) -> Duration {
        if up {
            self.scale_up_cooldown
        } else {
            self.scale_down_cooldown
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        ConfigError::ensure(self.min_replicas >= 1, "autoscaler.min_replicas", "must be at least 1")?;
        ConfigError::ensure(
            self.max_replicas >= self.min_replicas,
            "autoscaler.max_replicas",
            "must be at least min_replicas",
        )?;
        for (field, target) in [
            ("autoscaler.target_cpu_utilization", self.target_cpu_utilization),
            ("autoscaler.target_memory_utilization", self.target_memory_utilization),
        ] {
            ConfigError::ensure(target > 0.0 && target <= 1.0, field, "must be within (0, 1]")?;
        }
        for (field, interval) in [
            ("autoscaler.metrics_window", self.metrics_window),
            ("autoscaler.evaluation_interval", self.evaluation_interval),
            ("autoscaler.metrics_log_interval", self.metrics_log_interval),
        ] {
            ConfigError::ensure(!interval.is_zero(), field, "must be greater than zero")?;
        }
        ConfigError::ensure(
            self.action_queue_size > 0,
            "autoscaler.action_queue_size",
            "must be greater than zero",
        )?;
        for (name, metric) in &self.custom_metrics {
            ConfigError::ensure(
                metric.target_value > 0.0,
                &format!("autoscaler.custom_metrics.{name}.target_value"),
                "must be greater than zero",
            )?;
            ConfigError::ensure(
                metric.weight > 0.0,
                &format!("autoscaler.custom_metrics.{name}.weight"),
                "must be greater than zero",
            )?;
        }
        for (name, predictor) in [("cpu", &self.predictors.cpu), ("memory", &self.predictors.memory)] {
            ConfigError::ensure(
                predictor.window_size >= crate::predictor::MIN_SAMPLES,
                &format!("autoscaler.predictors.{name}.window_size"),
                "must hold at least 10 samples",
            )?;
        }
        Ok(())
    }
}
