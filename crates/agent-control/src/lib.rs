//! Messenger, Connection Manager variants, Control Channel, Bootstrap and
//! Datachannel: everything above the byte-level transport that makes up the
//! Agent ↔ Backend connection stack.

pub mod backoff;
pub mod bootstrap;
pub mod control_channel;
pub mod datachannel;
pub mod error;
pub mod manager;
pub mod messenger;
pub mod target;
pub mod variants;

pub use bootstrap::Bootstrap;
pub use control_channel::ControlChannel;
pub use datachannel::Datachannel;
pub use manager::{CmVariant, ConnectionManager};
pub use messenger::Messenger;
