//! Top-level error types tying configuration and the connection core together.

use thiserror::Error;

use agent_control::error::{BootstrapError, ControlChannelError, ManagerError};

pub use crate::config::ConfigError;

/// Errors raised by [`crate::agent::Agent`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("connection manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("control channel error: {0}")]
    ControlChannel(#[from] ControlChannelError),
}
