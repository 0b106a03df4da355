//! bulwark-core — the small set of interfaces every control-plane
//! component consumes.
//!
//! # Contents
//!
//! ```text
//! clock     Clock trait, SystemClock (tokio time), ManualClock (tests), Ticker
//! context   Context = cancellation token + optional deadline
//! kv        KvStore trait + MemoryKvStore
//! duration  "250ms" / "30s" / "5m" parsing and serde helpers
//! observe   ComponentMetrics snapshot shape + Observable trait
//! task      panic capture for spawned user callbacks
//! ```
//!
//! Components never reach for ambient globals: each one is built from its
//! config plus an injected [`SharedClock`] (and a [`KvStore`] where needed).

pub mod clock;
pub mod context;
pub mod duration;
pub mod error;
pub mod kv;
pub mod observe;
pub mod task;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, Sleep, SystemClock, Ticker};
pub use context::Context;
pub use duration::{format_duration, parse_duration};
pub use error::{ConfigError, ConfigResult};
pub use kv::{KvError, KvResult, KvStore, MemoryKvStore};
pub use observe::{ComponentMetrics, Observable};
pub use task::{join_outcome, panic_message, TaskFailure};
