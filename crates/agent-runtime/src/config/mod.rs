//! Environment-driven configuration for the connection core's tunables.

pub mod error;
pub mod loader;
pub mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::load;
pub use schema::Settings;
