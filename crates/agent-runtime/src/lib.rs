//! Configuration, logging, and the top-level [`agent::Agent`] that wires the
//! connection core (agent-core, agent-transport, agent-control) together and
//! runs it to completion.

pub mod agent;
pub mod config;
pub mod error;
pub mod logging;

pub use agent::Agent;
pub use config::Settings;
pub use error::RuntimeError;
