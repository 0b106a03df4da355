use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bulwark_core::duration::{human, human_opt};
use bulwark_core::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Latency,
    #[default]
    Error,
    Timeout,
    Network,
    Memory,
    Cpu,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Memory => "memory",
            Self::Cpu => "cpu",
        }
    }

    /// Faults that degrade the host or its network rather than one response.
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::Network | Self::Memory | Self::Cpu)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-scenario knobs. Only the ones relevant to the scenario's
/// `fault_type` are read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultParameters {
    #[serde(with = "human")]
    pub min_latency: Duration,
    #[serde(with = "human")]
    pub max_latency: Duration,
    /// Latency faults answer 408 after sleeping instead of calling through.
    pub return_error: bool,
    pub status_code: u16,
    pub error_message: String,
    #[serde(with = "human")]
    pub timeout: Duration,
    pub memory_size: u64,
    /// 0 means one worker per available CPU.
    pub cpu_workers: usize,
    /// How long memory or CPU stress is held.
    #[serde(with = "human")]
    pub stress_duration: Duration,
}

impl Default for FaultParameters {
    fn default() -> Self {
        Self {
            min_latency: Duration::from_millis(100),
            max_latency: Duration::from_secs(2),
            return_error: false,
            status_code: 500,
            error_message: "Chaos Engineering Fault Injection".to_string(),
            timeout: Duration::from_secs(30),
            memory_size: 100 * 1024 * 1024,
            cpu_workers: 0,
            stress_duration: Duration::from_secs(30),
        }
    }
}

/// A scenario's fault with only the parameters it uses.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    Latency {
        min: Duration,
        max: Duration,
        return_error: bool,
    },
    Error {
        status: u16,
        message: String,
    },
    Timeout(Duration),
    Network,
    Memory {
        bytes: u64,
        hold: Duration,
    },
    Cpu {
        workers: usize,
        hold: Duration,
    },
}

impl Fault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Latency { .. } => FaultKind::Latency,
            Self::Error { .. } => FaultKind::Error,
            Self::Timeout(_) => FaultKind::Timeout,
            Self::Network => FaultKind::Network,
            Self::Memory { .. } => FaultKind::Memory,
            Self::Cpu { .. } => FaultKind::Cpu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub enabled: bool,
    pub failure_rate: f64,
    /// Scenario deactivates itself this long after it was started.
    #[serde(with = "human_opt")]
    pub duration: Option<Duration>,
    pub fault_type: FaultKind,
    /// Exact request paths; empty or `*` targets everything.
    pub target_endpoints: Vec<String>,
    pub parameters: FaultParameters,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_rate: 0.1,
            duration: None,
            fault_type: FaultKind::Error,
            target_endpoints: Vec::new(),
            parameters: FaultParameters::default(),
        }
    }
}

impl ScenarioConfig {
    pub fn targets(&self, path: &str) -> bool {
        self.target_endpoints.is_empty()
            || self
                .target_endpoints
                .iter()
                .any(|target| target == "*" || target == path)
    }

    pub fn fault(&self) -> Fault {
        let p = &self.parameters;
        match self.fault_type {
            FaultKind::Latency => Fault::Latency {
                min: p.min_latency,
                max: p.max_latency,
                return_error: p.return_error,
            },
            FaultKind::Error => Fault::Error {
                status: p.status_code,
                message: p.error_message.clone(),
            },
            FaultKind::Timeout => Fault::Timeout(p.timeout),
            FaultKind::Network => Fault::Network,
            FaultKind::Memory => Fault::Memory {
                bytes: p.memory_size,
                hold: p.stress_duration,
            },
            FaultKind::Cpu => Fault::Cpu {
                workers: match p.cpu_workers {
                    0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
                    n => n,
                },
                hold: p.stress_duration,
            },
        }
    }

    fn validate(&self, name: &str) -> ConfigResult<()> {
        let field = |f: &str| format!("chaos.scenarios.{name}.{f}");
        ConfigError::ensure(
            (0.0..=1.0).contains(&self.failure_rate),
            &field("failure_rate"),
            "must be within [0, 1]",
        )?;
        if let Some(duration) = self.duration {
            ConfigError::ensure(!duration.is_zero(), &field("duration"), "must be greater than zero")?;
        }
        let p = &self.parameters;
        match self.fault_type {
            FaultKind::Latency => ConfigError::ensure(
                p.min_latency <= p.max_latency,
                &field("parameters.min_latency"),
                "must not exceed max_latency",
            ),
            FaultKind::Error => ConfigError::ensure(
                (100..=599).contains(&p.status_code),
                &field("parameters.status_code"),
                "must be an HTTP status code",
            ),
            FaultKind::Timeout => ConfigError::ensure(
                !p.timeout.is_zero(),
                &field("parameters.timeout"),
                "must be greater than zero",
            ),
            FaultKind::Memory => ConfigError::ensure(
                p.memory_size > 0,
                &field("parameters.memory_size"),
                "must be greater than zero",
            ),
            FaultKind::Network | FaultKind::Cpu => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    pub enabled: bool,
    pub global_failure_rate: f64,
    /// Turns network, memory and CPU faults into logged no-ops.
    pub safe_mode: bool,
    pub max_concurrent_faults: usize,
    #[serde(with = "human")]
    pub monitoring_interval: Duration,
    pub scenarios: BTreeMap<String, ScenarioConfig>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            global_failure_rate: 0.01,
            safe_mode: true,
            max_concurrent_faults: 3,
            monitoring_interval: Duration::from_secs(60),
            scenarios: BTreeMap::new(),
        }
    }
}

impl ChaosConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        ConfigError::ensure(
            (0.0..=1.0).contains(&self.global_failure_rate),
            "chaos.global_failure_rate",
            "must be within [0, 1]",
        )?;
        ConfigError::ensure(
            self.max_concurrent_faults > 0,
            "chaos.max_concurrent_faults",
            "must be greater than zero",
        )?;
        ConfigError::ensure(
            !self.monitoring_interval.is_zero(),
            "chaos.monitoring_interval",
            "must be greater than zero",
        )?;
        for (name, scenario) in &self.scenarios {
            scenario.validate(name)?;
        }
        Ok(())
    }
}
