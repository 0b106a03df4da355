//! Library side of `bulwarkd`: config loading and component assembly, so
//! the binary stays a thin CLI and embedders can reuse the wiring.

pub mod config;
pub mod daemon;

pub use config::BulwarkConfig;
pub use daemon::{Daemon, UPSTREAM_BREAKER};
