use bulwark_core::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("job queue is full for pool {pool} (capacity {capacity})")]
    QueueFull { pool: String, capacity: usize },

    #[error("worker pool {0} is stopped")]
    Stopped(String),

    #[error("worker pool {0} has not been started")]
    NotRunning(String),

    #[error("worker pool {0} is already running")]
    AlreadyRunning(String),

    #[error("submission cancelled by caller")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type PoolResult<T> = Result<T, PoolError>;
