use bulwark_core::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScalerError {
    #[error("auto-scaler is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type ScalerResult<T> = Result<T, ScalerError>;
