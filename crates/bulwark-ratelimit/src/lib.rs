//! bulwark-ratelimit — per-key admission control.
//!
//! # Request flow
//!
//! ```text
//! Request ──▶ keys_for(): global → ip → user → endpoint
//!              │
//!              ▼  (for each key, stop at the first denial)
//!          rule_for(key): endpoint override → ip/user override
//!                         → scope default → default_limit/window
//!              │
//!              ├─ local:       RwLock<map> of Mutex<Box<dyn Counter>>
//!              └─ distributed: KV key rate_limit:{key}:{window_start}
//!              ▼
//!          Decision { allowed, limit, remaining, retry_after, reset_after }
//! ```
//!
//! The three algorithms share the [`Counter`] contract and are picked by
//! [`Algorithm`] in config. KV failures in distributed mode fail open.

pub mod algorithm;
pub mod config;
pub mod error;
pub mod key;
pub mod layer;
pub mod limiter;

pub use algorithm::{Counter, Decision, FixedWindow, SlidingWindow, TokenBucket};
pub use config::{Algorithm, LimitRule, RateLimitConfig, ScopeDefaults};
pub use error::{RateLimitError, RateLimitResult};
pub use key::{RateLimitKey, Scope};
pub use layer::RateLimitLayer;
pub use limiter::{RateLimitStats, RateLimiter, Verdict};
