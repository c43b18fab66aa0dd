//! # agent
//!
//! Facade crate re-exporting the connection core's public surface: the
//! byte-level Transport, the Messenger/Connection Manager/Control Channel
//! stack, the MrTAP engine, and the top-level `Agent` runtime.
//!
//! ```rust,ignore
//! use agent::prelude::*;
//! ```

pub use agent_core::*;

pub use agent_control;
pub use agent_runtime;
pub use agent_transport;

/// Convenient imports for wiring up a running agent.
pub mod prelude {
    pub use agent_runtime::{Agent, RuntimeError, Settings};

    pub use agent_control::bootstrap::Bootstrap;
    pub use agent_control::control_channel::{ClusterUserSource, ConfigSink, ControlChannel, LogShipper};
    pub use agent_control::datachannel::{Datachannel, Plugin};
    pub use agent_control::manager::{CmVariant, ConnectionManager};
    pub use agent_control::messenger::Messenger;
    pub use agent_control::variants::{AgentDataVariant, ControlVariant, DaemonDataVariant};

    pub use agent_core::broker::Broker;
    pub use agent_core::message::{AppMessage, MessageType};
    pub use agent_core::mrtap::{MrtapEngine, MrtapMessage};
    pub use agent_core::signing::{BzCertVerifier, Signer};
    pub use agent_core::transport::Transport;

    pub use agent_transport::{HttpClient, WsTransport};
}
