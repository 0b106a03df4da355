use std::time::Duration;

use bulwark_core::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for {key}, retry after {retry_after:?}")]
    Exceeded { key: String, retry_after: Duration },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type RateLimitResult<T> = Result<T, RateLimitError>;
