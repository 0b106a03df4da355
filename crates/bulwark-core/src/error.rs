use thiserror::Error;

/// Configuration validation failure, raised at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error("invalid duration {input:?}: {reason}")]
    Duration { input: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns `Err(Invalid)` unless `cond` holds.
    pub fn ensure(cond: bool, field: &str, reason: &str) -> ConfigResult<()> {
        if cond {
            Ok(())
        } else {
            Err(Self::invalid(field, reason))
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
