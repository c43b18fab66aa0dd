//! Shared connection state (spec §3): the flags a Messenger publishes and a
//! Connection Manager/Control Channel observes, plus the outbound send queue
//! that decouples "I want to send a frame" from "a transport is currently up".

use tokio::sync::{mpsc, watch};

use crate::frame::Frame;

/// Readiness flags a Messenger publishes as it moves through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadinessFlags {
    /// The transport is up and the version handshake has completed.
    pub ready: bool,
    /// A reconnect attempt is in flight (transport dropped, not yet replaced).
    pub reconnecting: bool,
    /// The Backend has signaled the agent side is ready to receive traffic
    /// (spec §4.D's "agent-ready gate" on AgentData/DaemonData connections).
    pub agent_ready: bool,
}

/// Shared, observable connection state plus an outbound frame queue.
///
/// Cloning is cheap: the `watch` and `mpsc` handles are shared, so every
/// clone observes the same flags and feeds the same send queue.
#[derive(Clone)]
pub struct ConnectionState {
    flags_tx: std::sync::Arc<watch::Sender<ReadinessFlags>>,
    flags_rx: watch::Receiver<ReadinessFlags>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
}

/// The companion receiver for a `ConnectionState`'s outbound queue, held by
/// whichever task owns the live transport.
pub struct OutboundQueue {
    pub rx: mpsc::UnboundedReceiver<Frame>,
}

impl ConnectionState {
    pub fn new() -> (Self, OutboundQueue) {
        let (flags_tx, flags_rx) = watch::channel(ReadinessFlags::default());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                flags_tx: std::sync::Arc::new(flags_tx),
                flags_rx,
                outbound_tx,
            },
            OutboundQueue { rx: outbound_rx },
        )
    }

    pub fn flags(&self) -> ReadinessFlags {
        *self.flags_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessFlags> {
        self.flags_rx.clone()
    }

    pub fn set_ready(&self, ready: bool) {
        self.flags_tx.send_modify(|f| f.ready = ready);
    }

    pub fn set_reconnecting(&self, reconnecting: bool) {
        self.flags_tx.send_modify(|f| f.reconnecting = reconnecting);
    }

    pub fn set_agent_ready(&self, agent_ready: bool) {
        self.flags_tx.send_modify(|f| f.agent_ready = agent_ready);
    }

    /// Enqueues a frame for send once a transport is available. Returns an
    /// error only if every receiver (i.e. the whole Messenger) has been
    /// dropped.
    pub fn enqueue(&self, frame: Frame) -> Result<(), mpsc::error::SendError<Frame>> {
        self.outbound_tx.send(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PingFrame;

    #[test]
    fn flags_start_unready() {
        let (state, _queue) = ConnectionState::new();
        let flags = state.flags();
        assert!(!flags.ready);
        assert!(!flags.reconnecting);
        assert!(!flags.agent_ready);
    }

    #[test]
    fn set_ready_is_observable_via_subscribe() {
        let (state, _queue) = ConnectionState::new();
        let rx = state.subscribe();
        state.set_ready(true);
        assert!(rx.borrow().ready);
    }

    #[tokio::test]
    async fn enqueued_frames_are_received_in_order() {
        let (state, mut queue) = ConnectionState::new();
        state.enqueue(Frame::Ping(PingFrame::new())).unwrap();
        let frame = queue.rx.recv().await.unwrap();
        assert!(matches!(frame, Frame::Ping(_)));
    }
}
