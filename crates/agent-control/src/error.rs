//! Error types for the Messenger, Connection Manager, Bootstrap, Control
//! Channel and Datachannel (spec §7).

use thiserror::Error;

use agent_core::error::{BrokerError, CodecError, TransportError};

/// Errors raised by the Messenger (spec §4.B).
#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("no hub target for this application message")]
    NoTargetForMessage,

    #[error("completion with no invocation_id")]
    CompletionMissingInvocationId,

    #[error("completion referenced unknown invocation id '{0}'")]
    UnmatchedCompletion(String),

    #[error("server reported an error for target '{target}': {message}")]
    ServerError { target: String, message: String },

    /// The server closed the connection; `server_error` distinguishes
    /// "server said stop" from a transient network fault.
    #[error("websocket normal closure (server_error={server_error})")]
    WebsocketNormalClosure { server_error: bool },

    #[error("server ping timeout: no inbound frame for {0:?}")]
    PingTimeout(std::time::Duration),

    #[error("forced shutdown: invocation tracker did not drain within the endgame window")]
    ForcedShutdown,
}

/// Errors raised by a [`crate::manager::ConnectionManager`].
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("initial dial failed within the connect budget: {0}")]
    ConnectBudgetExceeded(String),

    #[error("messenger error: {0}")]
    Messenger(#[from] MessengerError),

    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("timed out waiting for agent-ready rendezvous")]
    AgentReadyTimeout,

    #[error("connection closed by peer: {0}")]
    ClassifiedClose(CloseClassification),

    #[error("reconnect policy exhausted after {0:?}")]
    ReconnectExhausted(std::time::Duration),
}

/// Daemon-side Data Connection close classification (spec §4.D, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClassification {
    PolicyEdited,
    PolicyDeleted,
    IdleTimeout,
    Other,
}

impl std::fmt::Display for CloseClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PolicyEdited => "policy_edited",
            Self::PolicyDeleted => "policy_deleted",
            Self::IdleTimeout => "idle_timeout",
            Self::Other => "unknown",
        };
        write!(f, "{s}")
    }
}

impl CloseClassification {
    /// Classifies a `CloseConnection{reason}` string by prefix match (spec §4.D).
    pub fn classify(reason: &str) -> Self {
        if reason.starts_with("policy_edited") {
            Self::PolicyEdited
        } else if reason.starts_with("policy_deleted") {
            Self::PolicyDeleted
        } else if reason.starts_with("idle_timeout") {
            Self::IdleTimeout
        } else {
            Self::Other
        }
    }

    /// The process exit code this classification drives (spec §6).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PolicyEdited => 10,
            Self::PolicyDeleted => 11,
            Self::IdleTimeout => 12,
            Self::Other => 1,
        }
    }
}

/// Errors raised by [`crate::bootstrap`] (spec §4.F).
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("http error: {0}")]
    Http(#[from] TransportError),

    #[error("stored token validation failed: {0}")]
    TokenValidation(String),

    /// Fatal: propagates out of bootstrap and shuts the CM down.
    #[error("signature failure: {0}")]
    SignatureFailure(String),
}

impl BootstrapError {
    /// Whether the CM should retry bootstrap (transient) or give up (fatal).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SignatureFailure(_))
    }
}

/// Errors raised by [`crate::control_channel::ControlChannel`].
#[derive(Debug, Error)]
pub enum ControlChannelError {
    #[error("messenger error: {0}")]
    Messenger(#[from] MessengerError),

    #[error("unknown connection id '{0}'")]
    UnknownConnectionId(String),

    #[error("unrecognised control message type")]
    UnrecognisedMessageType,

    #[error("malformed control payload: {0}")]
    MalformedPayload(String),

    #[error("configure failed signature/bzcert verification: {0}")]
    ConfigureVerificationFailed(String),

    #[error("close timed out after {0:?}")]
    CloseTimeout(std::time::Duration),

    #[error("failed to open child data connection: {0}")]
    ChildConnectionFailed(String),
}

/// Errors raised by [`crate::datachannel::Datachannel`].
#[derive(Debug, Error)]
pub enum DatachannelError {
    #[error("construction requires an initial Syn payload")]
    NotASyn,

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("mrtap pipeline error: {0}")]
    Pipeline(#[from] agent_core::error::PipelineError),
}
