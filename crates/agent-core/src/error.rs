//! Error types for the data model, broker, and MrTAP engine.

use thiserror::Error;

/// Errors raised by the byte [`crate::transport::Transport`] contract.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The initial dial failed.
    #[error("connection failed: {url} - {reason}")]
    ConnectionFailed {
        /// The URL that failed to connect.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// A send or receive failed after the transport was established.
    #[error("transport I/O error: {0}")]
    Io(String),

    /// The transport was already closed when an operation was attempted.
    #[error("transport closed: {0}")]
    Closed(String),
}

/// Errors raised while decoding/encoding frames or application messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload was not valid JSON.
    #[error("malformed frame: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// An application message carried an unknown `messageType`.
    #[error("unknown application message type: {0}")]
    UnknownMessageType(String),

    /// The base64-encoded payload could not be decoded.
    #[error("invalid base64 payload: {0}")]
    InvalidPayload(#[from] base64::DecodeError),
}

/// Errors raised by the [`crate::broker::Broker`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// `direct_message` targeted an id with no registered subscriber.
    #[error("no subscriber registered for channel '{0}'")]
    NoSuchSubscriber(String),

    /// `broadcast` was called with zero subscribers.
    #[error("no subscribers to broadcast to")]
    NoSubscribers,

    /// The broker has already been closed.
    #[error("broker already closed: {0}")]
    Closed(String),
}

/// Errors raised by the [`crate::mrtap`] handshake/validation engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MrtapError {
    /// The Syn's `schema_version` field was not parseable.
    #[error("failed to parse schema version: {0}")]
    FailedToParseVersion(String),

    /// The Syn's `target_id` did not match the agent's public key.
    #[error("target_id mismatch")]
    TargetIdMismatch,

    /// The Data's `bzcert_hash` did not match the BZCert validated at Syn.
    #[error("bzcert_hash does not match the validated BZCert")]
    BzCertMismatch,

    /// The BZCert presented at Syn failed external verification.
    #[error("bzcert verification failed: {0}")]
    BzCertVerificationFailed(String),

    /// The BZCert bound to this datachannel has expired.
    #[error("bzcert has expired")]
    BzCertExpired,

    /// A message's signature did not verify against the expected public key.
    #[error("invalid signature")]
    InvalidSignature,

    /// A Data/DataAck's `hpointer` did not match the expected chain value.
    #[error("unexpected hpointer")]
    UnexpectedHpointer,

    /// A message of a type other than Syn/Data was handed to `validate`.
    #[error("unexpected message type for validation")]
    UnexpectedMessageType,

    /// No BZCert has been validated yet on this datachannel (Data arrived first).
    #[error("no bzcert validated on this datachannel yet")]
    NoValidatedBzCert,

    /// Hashing the outbound ack failed a precondition (should not happen in practice).
    #[error("failed to hash outbound message")]
    HashFailure,
}

impl MrtapError {
    /// Whether this error should be reported to the peer using the legacy
    /// `keysplitting` type alias instead of the canonical `mrtap` type.
    pub fn wire_type_for_peer(peer_is_legacy: bool) -> &'static str {
        if peer_is_legacy { "keysplitting" } else { "mrtap" }
    }
}

/// Errors raised by the daemon-side MrTAP pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The handshake has not completed (no validated SynAck yet).
    #[error("handshake not complete: cannot send Data before SynAck validates")]
    HandshakeIncomplete,

    /// Recovery attempts were exhausted.
    #[error("mrtap recovery attempts exhausted (cap={0})")]
    RecoveryCapExceeded(u32),

    /// The underlying MrTAP engine rejected a message.
    #[error(transparent)]
    Mrtap(#[from] MrtapError),
}
