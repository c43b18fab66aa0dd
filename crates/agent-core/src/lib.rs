//! Wire data model, broker, and MrTAP handshake engine.
//!
//! This crate has no network I/O of its own: it defines the Frame/AppMessage
//! wire types, the record-separator codec, the invocation tracker, the
//! pub/sub broker, the byte-level [`Transport`](transport::Transport)
//! contract, and the MrTAP handshake engine. Everything that actually opens
//! sockets or HTTP connections lives in `agent-transport`/`agent-control`.

pub mod broker;
pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod invocation;
pub mod message;
pub mod mrtap;
pub mod signing;
pub mod transport;

pub use broker::Broker;
pub use connection::ConnectionState;
pub use frame::Frame;
pub use invocation::InvocationTracker;
pub use message::{AppMessage, MessageType};
pub use transport::{CloseReason, Transport};
