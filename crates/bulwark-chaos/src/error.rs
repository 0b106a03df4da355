use bulwark_core::ConfigError;
use thiserror::Error;

use crate::config::FaultKind;

#[derive(Debug, Error)]
pub enum ChaosError {
    #[error("unknown chaos scenario {0:?}")]
    UnknownScenario(String),

    #[error("scenario {scenario:?} injects {actual} faults, not {expected}")]
    FaultMismatch {
        scenario: String,
        expected: FaultKind,
        actual: FaultKind,
    },

    #[error("fault injector is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type ChaosResult<T> = Result<T, ChaosError>;
