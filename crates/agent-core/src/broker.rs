//! Pub/sub fan-out by channel id (spec §4.C): the Messenger hands every
//! decoded [`AppMessage`](crate::message::AppMessage) to the Broker, which
//! routes it to the one subscriber registered for its `channel_id`, or
//! broadcasts it to every subscriber when no single channel owns it.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::message::AppMessage;

/// Shared pub/sub router. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct Broker {
    inner: std::sync::Arc<RwLock<State>>,
}

#[derive(Default)]
struct State {
    subscribers: HashMap<String, mpsc::UnboundedSender<AppMessage>>,
    closed: bool,
    close_reason: Option<String>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(RwLock::new(State::default())),
        }
    }

    /// Registers a new subscriber under `channel_id`, returning the receiving
    /// end of its inbound queue. Replaces any existing subscriber under the
    /// same id (e.g. a datachannel reconnecting with the same id). Once the
    /// broker is closed, no new subscribers are admitted: the returned
    /// receiver is dropped immediately so `recv()` sees channel-end right
    /// away (spec line 79).
    pub fn subscribe(&self, channel_id: impl Into<String>) -> mpsc::UnboundedReceiver<AppMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.inner.write();
        if guard.closed {
            drop(tx);
            return rx;
        }
        guard.subscribers.insert(channel_id.into(), tx);
        rx
    }

    pub fn unsubscribe(&self, channel_id: &str) {
        self.inner.write().subscribers.remove(channel_id);
    }

    /// Routes a message to the single subscriber named by `message.channel_id`.
    pub fn direct_message(&self, message: AppMessage) -> Result<(), BrokerError> {
        let guard = self.inner.read();
        if guard.closed {
            return Err(BrokerError::Closed(message.channel_id));
        }
        let Some(sender) = guard.subscribers.get(&message.channel_id) else {
            return Err(BrokerError::NoSuchSubscriber(message.channel_id));
        };
        // A subscriber whose receiver was dropped is treated the same as
        // "not subscribed": the caller cleans up via `unsubscribe` separately.
        sender
            .send(message)
            .map_err(|e| BrokerError::NoSuchSubscriber(e.0.channel_id.clone()))
    }

    /// Delivers a clone of `message` to every subscriber, each keeping its own
    /// `channel_id` unmodified — used for control-plane messages that every
    /// open datachannel needs to observe (e.g. `CloseAllConnections`).
    pub fn broadcast(&self, message: &AppMessage) -> Result<(), BrokerError> {
        let guard = self.inner.read();
        if guard.closed {
            return Err(BrokerError::Closed("broker closed".into()));
        }
        if guard.subscribers.is_empty() {
            return Err(BrokerError::NoSubscribers);
        }
        for sender in guard.subscribers.values() {
            let _ = sender.send(AppMessage {
                channel_id: message.channel_id.clone(),
                message_type: message.message_type,
                schema_version: message.schema_version.clone(),
                payload: message.payload.clone(),
            });
        }
        Ok(())
    }

    /// Marks the broker closed with `reason`; further `direct_message`/
    /// `broadcast`/`subscribe` calls fail, and every existing subscriber is
    /// dropped so its `recv()` returns `None` immediately rather than
    /// hanging on a queue nothing will ever fill again (spec line 117).
    /// Subscribers that see their channel end can call
    /// [`Broker::close_reason`] to learn why.
    pub fn close(&self, reason: impl Into<String>) {
        let mut guard = self.inner.write();
        guard.closed = true;
        guard.close_reason = Some(reason.into());
        guard.subscribers.clear();
    }

    /// Why the broker was closed, if it has been.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.read().close_reason.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn msg(channel_id: &str) -> AppMessage {
        AppMessage::new(channel_id, MessageType::Stream, "1.0", vec![])
    }

    #[test]
    fn direct_message_routes_to_matching_subscriber() {
        let broker = Broker::new();
        let mut rx = broker.subscribe("chan-1");
        broker.direct_message(msg("chan-1")).unwrap();
        let received = rx.try_recv().unwrap();
        assert_eq!(received.channel_id, "chan-1");
    }

    #[test]
    fn direct_message_to_unknown_channel_errors() {
        let broker = Broker::new();
        let err = broker.direct_message(msg("ghost")).unwrap_err();
        assert_eq!(err, BrokerError::NoSuchSubscriber("ghost".into()));
    }

    #[test]
    fn broadcast_reaches_every_subscriber() {
        let broker = Broker::new();
        let mut a = broker.subscribe("a");
        let mut b = broker.subscribe("b");
        broker.broadcast(&msg("control")).unwrap();
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_ok());
    }

    #[test]
    fn broadcast_with_no_subscribers_errors() {
        let broker = Broker::new();
        assert_eq!(broker.broadcast(&msg("x")).unwrap_err(), BrokerError::NoSubscribers);
    }

    #[test]
    fn closed_broker_rejects_sends() {
        let broker = Broker::new();
        broker.subscribe("chan-1");
        broker.close("policy_edited");
        assert!(matches!(broker.direct_message(msg("chan-1")), Err(BrokerError::Closed(_))));
        assert_eq!(broker.close_reason().as_deref(), Some("policy_edited"));
    }

    #[test]
    fn closed_broker_drops_existing_subscribers() {
        let broker = Broker::new();
        let mut rx = broker.subscribe("chan-1");
        broker.close("shutdown");
        assert_eq!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));
    }

    #[test]
    fn closed_broker_rejects_new_subscribers() {
        let broker = Broker::new();
        broker.close("shutdown");
        let mut rx = broker.subscribe("chan-1");
        assert_eq!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));
    }

    #[test]
    fn unsubscribe_removes_the_route() {
        let broker = Broker::new();
        broker.subscribe("chan-1");
        broker.unsubscribe("chan-1");
        assert!(matches!(
            broker.direct_message(msg("chan-1")),
            Err(BrokerError::NoSuchSubscriber(_))
        ));
    }
}
