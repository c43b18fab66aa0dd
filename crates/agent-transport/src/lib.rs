//! Byte-level transports: a single-shot WebSocket [`Transport`] and the
//! Bootstrap HTTP client. Reconnect policy is intentionally absent here —
//! see `agent-control::manager` for that layer.

pub mod http;
pub mod websocket;

pub use http::{ControlChannelInfo, HttpClient};
pub use websocket::{WsDialOptions, WsTransport};
