//! bulwark-breaker — protects one dependency per breaker.
//!
//! # State machine
//!
//! ```text
//!            consecutive failures ≥ failure_threshold
//!   CLOSED ───────────────────────────────────────────▶ OPEN
//!     ▲                                                  │
//!     │ probes ≥ success_threshold                       │ first call after
//!     │ and success ratio ≥ half_open_success_ratio      │ open_timeout
//!     │                                                  ▼
//!     └──────────────────────────────────────────── HALF-OPEN
//!                      any probe failure ──────────▶ OPEN
//! ```
//!
//! `reset()` forces CLOSED from anywhere. State lives in an `AtomicU32` and
//! every edge is a compare-and-swap, so each transition happens once.
//!
//! Calls run in their own task under `min(caller deadline,
//! timeout_threshold)`; a panic inside the call is captured and counted as
//! a failure.

pub mod breaker;
pub mod config;
pub mod error;
pub mod layer;
pub mod manager;

pub use breaker::{BreakerMetrics, BreakerState, CircuitBreaker, FallbackFuture};
pub use config::BreakerConfig;
pub use error::{BreakerError, BreakerResult};
pub use layer::BreakerLayer;
pub use manager::BreakerManager;
