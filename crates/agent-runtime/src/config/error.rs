//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading [`super::schema::Settings`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration from the environment: {0}")]
    Figment(#[from] figment::Error),

    #[error("invalid configuration: {message}")]
    Validation { message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
