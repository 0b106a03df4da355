//! bulwark-pool — bounded priority job queue served by a self-sizing worker set.
//!
//! # Flow
//!
//! ```text
//!   submit ──▶ JobQueue (max-heap: priority desc, FIFO on ties)
//!                 │ pop
//!                 ▼
//!   worker 1..N (idle ⇄ busy, draining on scale-down/stop)
//!                 │ JobHandler::handle under the job timeout
//!                 ▼
//!   retry? ──yes──▶ back onto the queue, same priority
//!     │ no
//!     ▼
//!   results channel (bounded) ──▶ take_results()
//! ```
//!
//! Every `health_check_interval` the scaling loop compares queue
//! utilization with the thresholds and adds one worker or retires one idle
//! worker, each direction gated by its cooldown.

mod config;
mod error;
mod job;
mod pool;
mod queue;
mod worker;

pub use config::PoolConfig;
pub use error::{PoolError, PoolResult};
pub use job::{job_fn, Job, JobHandler, JobResult};
pub use pool::{PoolMetrics, WorkerPool};
pub use worker::{WorkerState, WorkerStats};
