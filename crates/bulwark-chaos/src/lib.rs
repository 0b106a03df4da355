//! bulwark-chaos — declarative, request-level fault injection.
//!
//! # Admission
//!
//! ```text
//!   request ──▶ enabled && running?
//!                 │ yes
//!                 ▼
//!           trial(global_failure_rate)
//!                 │ pass
//!                 ▼
//!           first live scenario (by name) targeting the path
//!                 │
//!                 ▼
//!           trial(scenario.failure_rate)
//!                 │ pass
//!                 ▼
//!           safe mode vetoes network/memory/cpu
//!                 │
//!                 ▼
//!           slot free under max_concurrent_faults? ──no──▶ pass through
//!                 │ yes
//!                 ▼
//!           latency | error | timeout | network | memory | cpu
//! ```
//!
//! Scenarios with a `duration` switch themselves off once it has elapsed,
//! checked on every lookup and on the monitor tick.

mod config;
mod error;
mod injector;
mod layer;
mod stress;

pub use config::{ChaosConfig, Fault, FaultKind, FaultParameters, ScenarioConfig};
pub use error::{ChaosError, ChaosResult};
pub use injector::{ChaosMetrics, FaultInjector, Injection, ScenarioMetrics};
pub use layer::ChaosLayer;
pub use stress::StressOutcome;
