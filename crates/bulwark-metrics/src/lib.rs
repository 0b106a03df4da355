//! bulwark-metrics — one place to read every component's gauges.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── register(name, Arc<dyn Observable>)  ← pool, breakers, limiter, chaos, scaler
//!   ├── collect()  → Snapshot { source → Vec<ComponentMetrics> }
//!   ├── latest()   → last Snapshot, for readers
//!   └── run()      → collect every `interval`, once more on shutdown
//! ```

mod collector;
mod config;

pub use collector::{MetricsCollector, Snapshot};
pub use config::MetricsConfig;
