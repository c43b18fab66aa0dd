//! The byte-level Transport contract (spec §4.A).
//!
//! A `Transport` dials exactly once, moves bytes, and reports when it is
//! done. No reconnect logic lives here — that is the Connection Manager's
//! job (spec §4.D), layered on top in `agent-control`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// Why a transport stopped delivering data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection cleanly.
    PeerClosed,
    /// The local side asked for a close via [`Transport::close`].
    LocalClosed,
    /// An I/O error tore the connection down.
    Error(String),
}

/// A single, non-retrying byte-level connection to the Backend.
///
/// Implementations dial once in their constructor (or an explicit `dial`, if
/// the concrete transport needs async setup before it can be polled) and
/// never reconnect internally — a failed or closed `Transport` is dead and
/// its owner (a Messenger, managed by a Connection Manager) is responsible
/// for creating a new one.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one opaque frame's worth of bytes.
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Waits for the next inbound chunk of bytes. Returns `Ok(None)` once the
    /// transport is done (closed or errored) and will never return `Ok(Some)`
    /// again — callers should check [`Transport::close_reason`] afterward.
    async fn recv(&self) -> Result<Option<Bytes>, TransportError>;

    /// True once the transport has stopped delivering data, for either end.
    fn is_done(&self) -> bool;

    /// Why the transport stopped, if it has.
    fn close_reason(&self) -> Option<CloseReason>;

    /// Requests a local close. Idempotent.
    async fn close(&self);
}
