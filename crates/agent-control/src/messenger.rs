//! Framing and RPC over a [`Transport`] (spec §4.B): the version handshake,
//! Invocation/Completion bookkeeping, client-side pings, and server-liveness
//! timeout all live here. Reconnect policy does not — that is the
//! [`crate::manager::ConnectionManager`]'s job.

use std::sync::Arc;
use std::time::Duration;

use agent_core::codec::{encode_handshake, RecordSeparatorCodec};
use agent_core::connection::{ConnectionState, OutboundQueue};
use agent_core::frame::{CloseFrame, CompletionFrame, Frame, InvocationFrame, PingFrame};
use agent_core::invocation::InvocationTracker;
use agent_core::message::AppMessage;
use agent_core::transport::Transport;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MessengerError;
use crate::target::TargetSelector;

/// Tunable liveness parameters, exposed for tests to shrink (spec §4.B).
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// How often the client pings the server when the send queue is idle.
    pub ping_interval: Duration,
    /// How long without an inbound frame before the connection is failed.
    pub server_ping_timeout: Duration,
    /// Upper bound on the close endgame (spec §4.B: "lasts at most 60s").
    pub endgame_timeout: Duration,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            server_ping_timeout: Duration::from_secs(30),
            endgame_timeout: Duration::from_secs(60),
        }
    }
}

/// A live framing/RPC session over one [`Transport`].
pub struct Messenger {
    state: ConnectionState,
    tracker: InvocationTracker,
    target_select: Arc<dyn TargetSelector>,
    done: CancellationToken,
    pump: tokio::task::JoinHandle<Result<(), MessengerError>>,
    disconnect_reason: Arc<parking_lot::Mutex<Option<String>>>,
}

impl Messenger {
    /// Dials nothing itself — `transport` is already connected. Sends the
    /// version handshake and starts the pump.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        tracker: InvocationTracker,
        target_select: Arc<dyn TargetSelector>,
        config: MessengerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InvocationFrame>), MessengerError> {
        let (state, outbound) = ConnectionState::new();
        let mut handshake = BytesMut::new();
        encode_handshake(&mut handshake);
        transport.send(handshake.freeze()).await?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let done = CancellationToken::new();
        let disconnect_reason = Arc::new(parking_lot::Mutex::new(None));

        let pump = tokio::spawn(run_pump_recording_disconnect(
            transport,
            tracker.clone(),
            outbound,
            inbound_tx,
            done.clone(),
            config,
            disconnect_reason.clone(),
        ));

        state.set_ready(true);
        Ok((
            Self {
                state,
                tracker,
                target_select,
                done,
                pump,
                disconnect_reason,
            },
            inbound_rx,
        ))
    }

    /// Why the pump stopped, if it stopped on its own (ping timeout,
    /// websocket closure, transport error) rather than via [`Messenger::close`].
    pub fn disconnect_reason(&self) -> Option<String> {
        self.disconnect_reason.lock().clone()
    }

    pub fn flags(&self) -> agent_core::connection::ReadinessFlags {
        self.state.flags()
    }

    pub fn subscribe_flags(&self) -> tokio::sync::watch::Receiver<agent_core::connection::ReadinessFlags> {
        self.state.subscribe()
    }

    /// Picks a hub target, registers an invocation, and enqueues the frame
    /// for send. Returns once the frame is queued — it does not wait for the
    /// matching Completion, so callers can have many invocations in flight
    /// at once; the tracker resolves each as its Completion arrives on the
    /// pump, independent of this call's caller (spec §4.B/§4.D: `send` is a
    /// non-blocking enqueue, not a synchronous RPC).
    pub fn send(&self, app_msg: AppMessage) -> Result<(), MessengerError> {
        let target = self.target_select.select(&app_msg)?;
        let argument = app_msg.to_wire_json()?;
        let (invocation_id, _completion_rx) = self.tracker.track(target);

        let frame = Frame::Invocation(InvocationFrame::new(target, vec![argument], invocation_id.clone()));
        if self.state.enqueue(frame).is_err() {
            self.tracker.abandon(&invocation_id);
            return Err(MessengerError::Transport(agent_core::error::TransportError::Closed(
                "messenger pump is gone".into(),
            )));
        }

        Ok(())
    }

    /// Closes the messenger: stops the pump and waits up to
    /// `config.endgame_timeout` for the invocation tracker to drain.
    pub async fn close(self, endgame_timeout: Duration) -> Result<(), MessengerError> {
        self.done.cancel();
        let drained = tokio::time::timeout(endgame_timeout, async {
            while !self.tracker.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok();

        let _ = self.pump.await;
        if drained {
            Ok(())
        } else {
            Err(MessengerError::ForcedShutdown)
        }
    }
}

/// Thin wrapper that records why the pump stopped so [`Messenger::disconnect_reason`]
/// can report it to the Connection Manager, which otherwise only sees the
/// inbound channel close with no detail (spec §4.B: "Messenger fails the
/// connection with a timeout error").
async fn run_pump_recording_disconnect(
    transport: Arc<dyn Transport>,
    tracker: InvocationTracker,
    outbound: OutboundQueue,
    inbound_tx: mpsc::UnboundedSender<InvocationFrame>,
    done: CancellationToken,
    config: MessengerConfig,
    disconnect_reason: Arc<parking_lot::Mutex<Option<String>>>,
) -> Result<(), MessengerError> {
    let result = run_pump(transport, tracker, outbound, inbound_tx, done, config).await;
    if let Err(e) = &result {
        *disconnect_reason.lock() = Some(e.to_string());
    }
    result
}

async fn run_pump(
    transport: Arc<dyn Transport>,
    tracker: InvocationTracker,
    mut outbound: OutboundQueue,
    inbound_tx: mpsc::UnboundedSender<InvocationFrame>,
    done: CancellationToken,
    config: MessengerConfig,
) -> Result<(), MessengerError> {
    let mut codec = RecordSeparatorCodec::new();
    let mut read_buf = BytesMut::new();
    let mut ping_timer = tokio::time::interval(config.ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_inbound = tokio::time::Instant::now();

    loop {
        if tokio::time::Instant::now().duration_since(last_inbound) > config.server_ping_timeout {
            return Err(MessengerError::PingTimeout(config.server_ping_timeout));
        }

        tokio::select! {
            biased;

            _ = done.cancelled() => {
                return Ok(());
            }

            frame = outbound.rx.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                send_frame(&transport, &mut codec, &frame).await?;
                ping_timer.reset();
            }

            _ = ping_timer.tick() => {
                if let Err(e) = send_frame(&transport, &mut codec, &Frame::Ping(PingFrame::new())).await {
                    warn!(error = %e, "failed to send client ping");
                }
            }

            received = transport.recv() => {
                match received? {
                    None => {
                        return match transport.close_reason() {
                            Some(agent_core::transport::CloseReason::PeerClosed) | None => {
                                Err(MessengerError::WebsocketNormalClosure { server_error: false })
                            }
                            Some(agent_core::transport::CloseReason::Error(e)) => {
                                Err(MessengerError::Transport(agent_core::error::TransportError::Io(e)))
                            }
                            Some(agent_core::transport::CloseReason::LocalClosed) => Ok(()),
                        };
                    }
                    Some(bytes) => {
                        last_inbound = tokio::time::Instant::now();
                        read_buf.extend_from_slice(&bytes);
                        while let Some(frame) = codec.decode(&mut read_buf).map_err(MessengerError::Codec)? {
                            if let Err(e) = handle_inbound_frame(frame, &tracker, &inbound_tx) {
                                warn!(error = %e, "dropping malformed inbound frame");
                            }
                        }
                    }
                }
            }
        }
    }
}

fn handle_inbound_frame(
    frame: Frame,
    tracker: &InvocationTracker,
    inbound_tx: &mpsc::UnboundedSender<InvocationFrame>,
) -> Result<(), MessengerError> {
    match frame {
        Frame::Invocation(invocation) => {
            let _ = inbound_tx.send(invocation);
            Ok(())
        }
        Frame::Completion(completion) => handle_completion(completion, tracker),
        Frame::Ping(_) => Ok(()),
        Frame::Close(CloseFrame { error, .. }) => Err(MessengerError::WebsocketNormalClosure {
            server_error: error.is_some(),
        }),
        Frame::Other(value) => {
            debug!(?value, "ignoring unrecognised frame type");
            Ok(())
        }
    }
}

fn handle_completion(completion: CompletionFrame, tracker: &InvocationTracker) -> Result<(), MessengerError> {
    let Some(id) = completion.invocation_id.clone() else {
        return Err(MessengerError::CompletionMissingInvocationId);
    };
    if let Some(error) = &completion.error {
        info!(invocation_id = %id, error, "server reported an error for invocation");
    }
    if !tracker.match_completion(completion) {
        return Err(MessengerError::UnmatchedCompletion(id));
    }
    Ok(())
}

async fn send_frame(
    transport: &Arc<dyn Transport>,
    codec: &mut RecordSeparatorCodec,
    frame: &Frame,
) -> Result<(), MessengerError> {
    let mut buf = BytesMut::new();
    codec.encode(frame, &mut buf).map_err(MessengerError::Codec)?;
    transport.send(Bytes::from(buf)).await.map_err(MessengerError::Transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::AgentControlSelector;
    use agent_core::error::TransportError;
    use agent_core::message::MessageType;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    /// An in-memory loopback transport: whatever is sent via `send` is
    /// immediately made available via `recv`, so tests can drive full
    /// Messenger round trips without real sockets.
    struct LoopbackTransport {
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
        inbound_tx: mpsc::UnboundedSender<Bytes>,
        sent: StdMutex<Vec<Bytes>>,
        notify: Notify,
        done: CancellationToken,
    }

    impl LoopbackTransport {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                inbound: tokio::sync::Mutex::new(rx),
                inbound_tx: tx,
                sent: StdMutex::new(Vec::new()),
                notify: Notify::new(),
                done: CancellationToken::new(),
            })
        }

        fn push_inbound(&self, bytes: Bytes) {
            let _ = self.inbound_tx.send(bytes);
        }
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn send(&self, data: Bytes) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(data);
            self.notify.notify_waiters();
            Ok(())
        }

        async fn recv(&self) -> Result<Option<Bytes>, TransportError> {
            tokio::select! {
                _ = self.done.cancelled() => Ok(None),
                item = async { self.inbound.lock().await.recv().await } => Ok(item),
            }
        }

        fn is_done(&self) -> bool {
            self.done.is_cancelled()
        }

        fn close_reason(&self) -> Option<agent_core::transport::CloseReason> {
            None
        }

        async fn close(&self) {
            self.done.cancel();
        }
    }

    #[tokio::test]
    async fn connect_sends_version_handshake() {
        let transport = LoopbackTransport::new();
        let tracker = InvocationTracker::new();
        let (messenger, _inbound) = Messenger::connect(
            transport.clone(),
            tracker,
            Arc::new(AgentControlSelector),
            MessengerConfig::default(),
        )
        .await
        .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with(b"{\"protocol\":\"json\""));
        drop(sent);
        messenger.done.cancel();
    }

    #[tokio::test]
    async fn send_returns_before_the_completion_arrives_and_the_tracker_resolves_it_later() {
        let transport = LoopbackTransport::new();
        let tracker = InvocationTracker::new();
        let (messenger, _inbound) = Messenger::connect(
            transport.clone(),
            tracker.clone(),
            Arc::new(AgentControlSelector),
            MessengerConfig::default(),
        )
        .await
        .unwrap();

        // send() returns as soon as the frame is queued, well before any reply.
        let app_msg = AppMessage::new("chan-1", MessageType::HealthCheck, "1.0", b"ping".to_vec());
        let result = messenger.send(app_msg);
        assert!(result.is_ok());
        assert!(!tracker.is_empty());

        // A fresh tracker assigns invocation ids starting at "1".
        let mut completion_bytes = BytesMut::new();
        let mut codec = RecordSeparatorCodec::new();
        codec
            .encode(
                &Frame::Completion(CompletionFrame {
                    kind: agent_core::frame::CompletionTag,
                    invocation_id: Some("1".into()),
                    result: Some(serde_json::json!("ok")),
                    error: None,
                }),
                &mut completion_bytes,
            )
            .unwrap();
        transport.push_inbound(completion_bytes.freeze());

        for _ in 0..50 {
            if tracker.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(tracker.is_empty());

        messenger.done.cancel();
    }

    #[tokio::test]
    async fn send_allows_multiple_concurrent_in_flight_invocations() {
        let transport = LoopbackTransport::new();
        let tracker = InvocationTracker::new();
        let (messenger, _inbound) = Messenger::connect(transport, tracker.clone(), Arc::new(AgentControlSelector), MessengerConfig::default())
            .await
            .unwrap();

        for _ in 0..3 {
            let app_msg = AppMessage::new("chan-1", MessageType::HealthCheck, "1.0", b"ping".to_vec());
            messenger.send(app_msg).unwrap();
        }
        assert_eq!(tracker.len(), 3);

        messenger.done.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn server_ping_timeout_closes_with_a_timeout_error() {
        let transport = LoopbackTransport::new();
        let tracker = InvocationTracker::new();
        let config = MessengerConfig {
            ping_interval: Duration::from_millis(50),
            server_ping_timeout: Duration::from_millis(200),
            endgame_timeout: Duration::from_secs(1),
        };
        let (messenger, mut inbound) = Messenger::connect(transport, tracker, Arc::new(AgentControlSelector), config)
            .await
            .unwrap();

        // No inbound frames ever arrive; paused time auto-advances through the
        // ping/timeout checks until the pump gives up and drops the channel.
        assert!(inbound.recv().await.is_none());
        assert!(matches!(messenger.disconnect_reason(), Some(reason) if reason.contains("ping timeout")));
    }
}
