use std::time::Duration;

use bulwark_core::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit breaker is open")]
    Open,

    #[error("half-open request limit exceeded")]
    HalfOpenLimitExceeded,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("call cancelled by caller")]
    Cancelled,

    #[error("callback panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Inner(anyhow::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BreakerError {
    /// The call was refused without running; retry logic treats both kinds as open.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open | Self::HalfOpenLimitExceeded)
    }
}

pub type BreakerResult<T> = Result<T, BreakerError>;
