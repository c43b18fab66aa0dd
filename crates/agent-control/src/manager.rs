//! The Connection Manager (spec §4.D): owns a Messenger, a Broker, and an
//! invocation tracker; drives dial/reconnect under backoff; and exposes the
//! `send/subscribe/ready/done/err/close` contract common to all three
//! variants. What differs per variant — dial URL composition, reconnect
//! policy, an extra readiness gate, and the target selector — is captured by
//! the [`CmVariant`] trait (spec §9's "capability interface" note), so this
//! file contains exactly one state machine instead of three.

use std::sync::Arc;
use std::time::Duration;

use agent_core::broker::Broker;
use agent_core::error::TransportError;
use agent_core::invocation::InvocationTracker;
use agent_core::message::AppMessage;
use agent_transport::WsTransport;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::{Backoff, BackoffConfig, ElapsedCaps};
use crate::error::{CloseClassification, ManagerError};
use crate::messenger::{Messenger, MessengerConfig};
use crate::target::TargetSelector;

/// Capacity of the `send` queue (spec §4.D: "buffered send queue (capacity 50)").
pub const SEND_QUEUE_CAPACITY: usize = 50;

/// What one Connection Manager variant supplies beyond the common state
/// machine: where to dial, how long to keep retrying, whether there's an
/// extra readiness gate, and which hub targets are legal to send to.
#[async_trait]
pub trait CmVariant: Send + Sync + 'static {
    /// Resolves the URL and bearer token to dial, performing whatever
    /// bootstrap/discovery calls that requires. Errors classify as
    /// retryable unless `ManagerError::Bootstrap` wraps a fatal
    /// [`crate::error::BootstrapError`].
    async fn resolve_dial(&self) -> Result<(String, Option<String>), ManagerError>;

    fn target_selector(&self) -> Arc<dyn TargetSelector>;

    fn elapsed_caps(&self) -> ElapsedCaps;

    /// An extra rendezvous the connection must clear before its send queue
    /// is allowed to flush (the daemon Data Connection's `AgentConnected`
    /// wait). `None` means no extra gate.
    fn agent_ready_timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether the broker survives a transport replacement on reconnect
    /// (true for the daemon Data Connection, which keeps datachannels alive
    /// across reconnects).
    fn broker_survives_reconnect(&self) -> bool {
        false
    }

    fn messenger_config(&self) -> MessengerConfig {
        MessengerConfig::default()
    }

    /// Classifies an inbound `CloseConnection{reason}` frame. `None` (the
    /// default) means this variant has no such frame and it should be routed
    /// as an ordinary application message instead.
    fn classify_close(&self, _reason: &str) -> Option<CloseClassification> {
        None
    }

    /// A frame to announce on this CM's final death, before the send queue
    /// is drained and the transport closes (spec §4.D: the daemon Data
    /// Connection's `CloseAgentWebsocket{reason}`). `None` (the default)
    /// means this variant has nothing to announce.
    fn final_close_message(&self, _reason: &str) -> Option<AppMessage> {
        None
    }
}

/// Reason recorded when [`ConnectionManager::close`] tears a connection down
/// on request rather than in response to a peer- or policy-driven close.
const CM_CLOSED_REASON: &str = "connection manager closed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Connecting,
    Ready,
    Reconnecting,
    Done,
}

/// The daemon Data Connection's `AgentConnected` rendezvous (spec §4.D):
/// until it clears, the send queue stays un-drained. Variants with no gate
/// (`agent_ready_timeout() == None`) start, and stay, cleared.
struct Gate {
    cleared: bool,
    deadline: Option<tokio::time::Instant>,
}

impl Gate {
    fn cleared() -> Self {
        Self { cleared: true, deadline: None }
    }

    fn waiting(timeout: Duration) -> Self {
        Self {
            cleared: false,
            deadline: Some(tokio::time::Instant::now() + timeout),
        }
    }

    async fn wait_deadline(&self) {
        match self.deadline {
            Some(deadline) if !self.cleared => tokio::time::sleep_until(deadline).await,
            _ => std::future::pending::<()>().await,
        }
    }
}

struct Shared {
    run_state: RwLock<RunState>,
    last_error: RwLock<Option<String>>,
}

/// Owns one Messenger at a time, redialing it under backoff per the
/// variant's policy, and republishing readiness as it does.
pub struct ConnectionManager<V: CmVariant> {
    variant: Arc<V>,
    broker: Broker,
    send_tx: mpsc::Sender<AppMessage>,
    shared: Arc<Shared>,
    done: CancellationToken,
    ready_rx: watch::Receiver<bool>,
    supervisor: tokio::task::JoinHandle<()>,
}

impl<V: CmVariant> ConnectionManager<V> {
    /// Constructs, dials, and starts the supervisor. Fails only if the
    /// initial dial does not succeed within the variant's connect budget.
    pub async fn new(variant: V) -> Result<Self, ManagerError> {
        let variant = Arc::new(variant);
        let broker = Broker::new();
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = watch::channel(false);
        let done = CancellationToken::new();
        let shared = Arc::new(Shared {
            run_state: RwLock::new(RunState::Connecting),
            last_error: RwLock::new(None),
        });

        let connect_budget = variant.elapsed_caps().cap_for(false);
        let first = tokio::time::timeout(connect_budget, dial_once(variant.as_ref())).await;
        let (transport, bearer) = match first {
            Ok(Ok(dialed)) => dialed,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ManagerError::ConnectBudgetExceeded(format!("{connect_budget:?}"))),
        };
        let _ = bearer;

        let tracker = InvocationTracker::new();
        let (messenger, inbound) = Messenger::connect(
            transport,
            tracker.clone(),
            variant.target_selector(),
            variant.messenger_config(),
        )
        .await?;

        let gate = match variant.agent_ready_timeout() {
            Some(timeout) => Gate::waiting(timeout),
            None => {
                *shared.run_state.write() = RunState::Ready;
                let _ = ready_tx.send(true);
                Gate::cleared()
            }
        };

        let supervisor = tokio::spawn(supervise(
            variant.clone(),
            broker.clone(),
            messenger,
            inbound,
            send_rx,
            shared.clone(),
            ready_tx,
            done.clone(),
            gate,
        ));

        Ok(Self {
            variant,
            broker,
            send_tx,
            shared,
            done,
            ready_rx,
            supervisor,
        })
    }

    /// Non-blocking push into the buffered send queue.
    pub fn send(&self, message: AppMessage) -> Result<(), ManagerError> {
        self.send_tx.try_send(message).map_err(|_| {
            ManagerError::Messenger(crate::error::MessengerError::Transport(TransportError::Closed(
                "connection manager send queue is full or closed".into(),
            )))
        })
    }

    pub fn subscribe(&self, channel_id: impl Into<String>) -> mpsc::UnboundedReceiver<AppMessage> {
        self.broker.subscribe(channel_id)
    }

    pub fn ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    pub fn err(&self) -> Option<String> {
        self.shared.last_error.read().clone()
    }

    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Cancels this connection's supervisor with a recognizable `reason`,
    /// surfaced afterwards through [`ConnectionManager::err`] (spec §4.E:
    /// `Restart` closes the owning CM with the caller-supplied payload).
    pub fn shutdown(&self, reason: impl Into<String>) {
        *self.shared.last_error.write() = Some(reason.into());
        self.done.cancel();
    }

    /// Closes the connection, bounded by `timeout`.
    pub async fn close(self, timeout: Duration) -> Result<(), ManagerError> {
        self.done.cancel();
        let _ = tokio::time::timeout(timeout, self.supervisor).await;
        self.broker.close(CM_CLOSED_REASON);
        Ok(())
    }
}

async fn dial_once<V: CmVariant>(variant: &V) -> Result<(Arc<dyn agent_core::transport::Transport>, Option<String>), ManagerError> {
    let (url, bearer) = variant.resolve_dial().await?;
    let transport = WsTransport::dial(
        &url,
        agent_transport::WsDialOptions {
            bearer_token: bearer.clone(),
        },
    )
    .await
    .map_err(|e| ManagerError::Messenger(crate::error::MessengerError::Transport(e)))?;
    Ok((Arc::new(transport), bearer))
}

#[allow(clippy::too_many_arguments)]
async fn supervise<V: CmVariant>(
    variant: Arc<V>,
    broker: Broker,
    mut messenger: Messenger,
    mut inbound: mpsc::UnboundedReceiver<agent_core::frame::InvocationFrame>,
    mut send_rx: mpsc::Receiver<AppMessage>,
    shared: Arc<Shared>,
    ready_tx: watch::Sender<bool>,
    done: CancellationToken,
    mut gate: Gate,
) {
    let mut backoff = Backoff::new(BackoffConfig::default());
    let mut has_connected_once = true;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = done.cancelled() => Outcome::Cancelled,
            _ = gate.wait_deadline() => Outcome::AgentReadyTimedOut,
            Some(app_msg) = send_rx.recv(), if gate.cleared => {
                // Messenger::send only enqueues onto the outbound channel and
                // returns; it never waits on the matching Completion, so this
                // arm can't stall the supervisor loop behind a slow peer.
                if let Err(e) = messenger.send(app_msg) {
                    warn!(error = %e, "send failed on current connection");
                }
                continue;
            }
            invocation = inbound.recv() => {
                match invocation {
                    Some(frame) if frame.target == "AgentConnected" => {
                        if !gate.cleared {
                            gate.cleared = true;
                            *shared.run_state.write() = RunState::Ready;
                            let _ = ready_tx.send(true);
                            info!("agent-ready rendezvous cleared");
                        }
                        continue;
                    }
                    Some(frame) if frame.target == "CloseConnection" => {
                        let reason = frame
                            .arguments
                            .first()
                            .and_then(|v| v.get("reason"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        match variant.classify_close(reason) {
                            Some(classification) => Outcome::ClassifiedClose(classification),
                            None => {
                                warn!(reason, "ignoring unrecognised CloseConnection on a variant with no classifier");
                                continue;
                            }
                        }
                    }
                    Some(frame) => {
                        match AppMessage::from_wire_json(frame.arguments.first().unwrap_or(&serde_json::Value::Null)) {
                            Ok(app_msg) => {
                                if let Err(e) = broker.direct_message(app_msg) {
                                    warn!(error = %e, "broker could not route inbound message");
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to decode inbound application message"),
                        }
                        continue;
                    }
                    None => Outcome::Disconnected,
                }
            }
        };

        match outcome {
            Outcome::Cancelled => {
                *shared.run_state.write() = RunState::Done;
                let reason = shared.last_error.read().clone().unwrap_or_else(|| CM_CLOSED_REASON.into());
                finalize_variant_teardown(variant.as_ref(), &mut messenger, &mut send_rx, &reason);
                let _ = ready_tx.send(false);
                return;
            }
            Outcome::AgentReadyTimedOut => {
                *shared.run_state.write() = RunState::Done;
                let reason = ManagerError::AgentReadyTimeout.to_string();
                *shared.last_error.write() = Some(reason.clone());
                finalize_variant_teardown(variant.as_ref(), &mut messenger, &mut send_rx, &reason);
                let _ = ready_tx.send(false);
                broker.close("agent-ready rendezvous timed out");
                warn!("agent-ready rendezvous timed out, closing");
                return;
            }
            Outcome::ClassifiedClose(classification) => {
                *shared.run_state.write() = RunState::Done;
                *shared.last_error.write() = Some(ManagerError::ClassifiedClose(classification).to_string());
                let reason = classification.to_string();
                finalize_variant_teardown(variant.as_ref(), &mut messenger, &mut send_rx, &reason);
                let _ = ready_tx.send(false);
                broker.close(reason);
                warn!(%classification, "connection closed by peer, classified");
                return;
            }
            Outcome::Disconnected => {
                if let Some(reason) = messenger.disconnect_reason() {
                    *shared.last_error.write() = Some(reason);
                }
                let _ = ready_tx.send(false);
                if !variant.broker_survives_reconnect() {
                    broker.close(messenger.disconnect_reason().unwrap_or_else(|| "disconnected".into()));
                }
                *shared.run_state.write() = RunState::Reconnecting;

                let cap = variant.elapsed_caps().cap_for(has_connected_once);
                match reconnect(variant.as_ref(), &mut backoff, cap, &done).await {
                    Some((transport,)) => {
                        let tracker = InvocationTracker::new();
                        match Messenger::connect(transport, tracker, variant.target_selector(), variant.messenger_config()).await {
                            Ok((new_messenger, new_inbound)) => {
                                messenger = new_messenger;
                                inbound = new_inbound;
                                has_connected_once = true;
                                backoff.reset();
                                gate = match variant.agent_ready_timeout() {
                                    Some(timeout) => Gate::waiting(timeout),
                                    None => {
                                        *shared.run_state.write() = RunState::Ready;
                                        let _ = ready_tx.send(true);
                                        Gate::cleared()
                                    }
                                };
                                info!("reconnected");
                            }
                            Err(e) => {
                                *shared.last_error.write() = Some(e.to_string());
                                error!(error = %e, "reconnect failed to establish a messenger");
                            }
                        }
                    }
                    None => {
                        *shared.run_state.write() = RunState::Done;
                        let reason = format!("reconnect exhausted after {cap:?}");
                        *shared.last_error.write() = Some(reason.clone());
                        finalize_variant_teardown(variant.as_ref(), &mut messenger, &mut send_rx, &reason);
                        let _ = ready_tx.send(false);
                        return;
                    }
                }
            }
        }
    }
}

enum Outcome {
    Cancelled,
    Disconnected,
    AgentReadyTimedOut,
    ClassifiedClose(CloseClassification),
}

/// Announces `variant`'s final-close frame, if any, then flushes whatever
/// is still sitting in the send queue (bounded by `SEND_QUEUE_CAPACITY`)
/// before the transport goes away (spec §4.D).
fn finalize_variant_teardown<V: CmVariant>(
    variant: &V,
    messenger: &mut Messenger,
    send_rx: &mut mpsc::Receiver<AppMessage>,
    reason: &str,
) {
    if let Some(frame) = variant.final_close_message(reason) {
        if let Err(e) = messenger.send(frame) {
            warn!(error = %e, "failed to enqueue final close frame");
        }
    }
    while let Ok(app_msg) = send_rx.try_recv() {
        if let Err(e) = messenger.send(app_msg) {
            warn!(error = %e, "failed to flush queued message during final teardown");
            break;
        }
    }
}

async fn reconnect<V: CmVariant>(
    variant: &V,
    backoff: &mut Backoff,
    elapsed_cap: Duration,
    done: &CancellationToken,
) -> Option<(Arc<dyn agent_core::transport::Transport>,)> {
    let deadline = tokio::time::Instant::now() + elapsed_cap;
    loop {
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        let delay = backoff.next_delay();
        tokio::select! {
            _ = done.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match dial_once(variant).await {
            Ok((transport, _bearer)) => return Some((transport,)),
            Err(ManagerError::Bootstrap(e)) if e.is_fatal() => {
                error!(error = %e, "reconnect hit a fatal bootstrap error, giving up");
                return None;
            }
            Err(e) => warn!(error = %e, "reconnect attempt failed, backing off"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FatalBootstrapVariant;

    #[async_trait]
    impl CmVariant for FatalBootstrapVariant {
        async fn resolve_dial(&self) -> Result<(String, Option<String>), ManagerError> {
            Err(ManagerError::Bootstrap(crate::error::BootstrapError::SignatureFailure("forged".into())))
        }

        fn target_selector(&self) -> Arc<dyn TargetSelector> {
            unimplemented!("not exercised: resolve_dial fails before a target is ever selected")
        }

        fn elapsed_caps(&self) -> ElapsedCaps {
            ElapsedCaps::DATA
        }
    }

    #[tokio::test]
    async fn reconnect_gives_up_immediately_on_a_fatal_bootstrap_error() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10),
            jitter_fraction: 0.0,
        });
        let done = CancellationToken::new();

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            reconnect(&FatalBootstrapVariant, &mut backoff, Duration::from_secs(10), &done),
        )
        .await
        .expect("a fatal bootstrap error must not fall into the retry loop");

        assert!(result.is_none());
    }

    #[test]
    fn a_variant_with_no_gate_starts_cleared() {
        let gate = Gate::cleared();
        assert!(gate.cleared);
        assert!(gate.deadline.is_none());
    }

    #[tokio::test]
    async fn a_waiting_gate_fires_its_deadline_future_once_expired() {
        let gate = Gate::waiting(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(5)).await;
        // wait_deadline resolves immediately since the deadline has passed.
        tokio::time::timeout(Duration::from_millis(50), gate.wait_deadline()).await.unwrap();
    }

    #[tokio::test]
    async fn a_cleared_gate_never_fires_its_deadline_future() {
        let mut gate = Gate::waiting(Duration::from_millis(1));
        gate.cleared = true;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(tokio::time::timeout(Duration::from_millis(20), gate.wait_deadline()).await.is_err());
    }
}
