//! The Control Channel (spec §4.E): heartbeats over the Control Connection,
//! and dispatches inbound administrative commands, one worker task per
//! message, serialising writes to the child-connection map behind a mutex.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_core::message::{AppMessage, MessageType};
use agent_core::signing::BzCertVerifier;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::backoff::ElapsedCaps;
use crate::error::ControlChannelError;
use crate::manager::ConnectionManager;
use crate::messenger::MessengerConfig;
use crate::variants::{AgentDataVariant, ControlVariant};

/// Close timeout for the Control Channel's own shutdown (spec §4.E).
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Heartbeat cadence (spec §4.E).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Persists configuration artifacts delivered over `Configure`/`KeyShard`.
#[async_trait]
pub trait ConfigSink: Send + Sync {
    async fn persist_service_account_config(&self, payload: &[u8]) -> Result<(), ControlChannelError>;
    async fn persist_key_shard(&self, target_id: &str, shard: &[u8]) -> Result<(), ControlChannelError>;
}

/// Ships local logs to the Backend for `RetrieveLogs`.
#[async_trait]
pub trait LogShipper: Send + Sync {
    async fn ship_logs(&self) -> Result<(), ControlChannelError>;
}

/// Supplies the current set of reportable cluster-user subjects
/// (Kubernetes-variant agents only).
#[async_trait]
pub trait ClusterUserSource: Send + Sync {
    async fn current_subjects(&self) -> Vec<String>;
}

#[derive(Debug, Deserialize)]
struct OpenWebsocketPayload {
    connection_id: String,
    service_url: String,
}

#[derive(Debug, Deserialize)]
struct CloseWebsocketPayload {
    connection_id: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct KeyShardPayload {
    target_id: String,
    #[serde(with = "serde_bytes_b64")]
    shard: Vec<u8>,
}

/// A signed service-account configuration envelope (spec §4.E `Configure`):
/// the config bytes, the BZCert that identifies who signed them, and the
/// signature over the config bytes.
#[derive(Debug, Deserialize)]
struct SignedConfigurePayload {
    #[serde(with = "serde_bytes_b64")]
    config: Vec<u8>,
    #[serde(with = "serde_bytes_b64")]
    bzcert: Vec<u8>,
    #[serde(with = "serde_bytes_b64")]
    signature: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct HeartbeatPayload {
    data_channel_count: usize,
    cluster_users: Option<Vec<String>>,
}

mod serde_bytes_b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

/// A child Data Connection opened on behalf of `OpenWebsocket` (spec §4.E):
/// a real Connection Manager dialed directly at the hub-supplied
/// `service_url`, not a placeholder.
struct ChildConnection {
    cm: ConnectionManager<AgentDataVariant>,
}

/// Blocklist-on-`:` subject filter (the `Configure`/cluster-user open
/// question, see DESIGN.md): a subject containing `:` is treated as a
/// system role identity and excluded from reporting.
pub fn is_reportable_subject(subject: &str) -> bool {
    !subject.contains(':')
}

/// Drives heartbeats and command dispatch over one Control Connection.
pub struct ControlChannel {
    cm: Arc<ConnectionManager<ControlVariant>>,
    connections: Mutex<HashMap<String, ChildConnection>>,
    bzcert_verifier: Arc<dyn BzCertVerifier>,
    config_sink: Arc<dyn ConfigSink>,
    log_shipper: Arc<dyn LogShipper>,
    cluster_users: Option<Arc<dyn ClusterUserSource>>,
    last_cluster_users: parking_lot::Mutex<Vec<String>>,
    was_ready_last_tick: std::sync::atomic::AtomicBool,
    runtime_errors: mpsc::UnboundedSender<ControlChannelError>,
}

impl ControlChannel {
    pub fn new(
        cm: Arc<ConnectionManager<ControlVariant>>,
        bzcert_verifier: Arc<dyn BzCertVerifier>,
        config_sink: Arc<dyn ConfigSink>,
        log_shipper: Arc<dyn LogShipper>,
        cluster_users: Option<Arc<dyn ClusterUserSource>>,
    ) -> (Self, mpsc::UnboundedReceiver<ControlChannelError>) {
        let (runtime_errors, runtime_error_rx) = mpsc::unbounded_channel();
        (
            Self {
                cm,
                connections: Mutex::new(HashMap::new()),
                bzcert_verifier,
                config_sink,
                log_shipper,
                cluster_users,
                last_cluster_users: parking_lot::Mutex::new(Vec::new()),
                was_ready_last_tick: std::sync::atomic::AtomicBool::new(false),
                runtime_errors,
            },
            runtime_error_rx,
        )
    }

    /// One heartbeat tick (spec §4.E): returns whether to report "sending
    /// pongs" upstream. Applies the reconnect-hysteresis rule: the tick
    /// immediately after becoming ready again reports `false` once, to give
    /// watchdogs one grace interval.
    pub async fn heartbeat_tick(&self) -> bool {
        let ready = self.cm.ready();
        let was_ready = self.was_ready_last_tick.swap(ready, std::sync::atomic::Ordering::SeqCst);

        if !ready {
            return false;
        }
        if ready && !was_ready {
            return false;
        }

        let cluster_users = if let Some(source) = &self.cluster_users {
            let mut subjects: Vec<String> = source
                .current_subjects()
                .await
                .into_iter()
                .filter(|s| is_reportable_subject(s))
                .collect();
            subjects.sort();

            let mut last = self.last_cluster_users.lock();
            let changed = *last != subjects;
            if changed {
                *last = subjects.clone();
            }
            drop(last);

            if changed {
                let payload = serde_json::to_vec(&subjects).unwrap_or_default();
                let msg = AppMessage::new("control", MessageType::ClusterUsers, "1.0", payload);
                if let Err(e) = self.cm.send(msg) {
                    warn!(error = %e, "failed to enqueue cluster-users update");
                }
            }
            Some(subjects)
        } else {
            None
        };

        let payload = HeartbeatPayload {
            data_channel_count: self.connections.lock().await.len(),
            cluster_users,
        };
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        let msg = AppMessage::new("control", MessageType::HealthCheck, "1.0", bytes);
        if let Err(e) = self.cm.send(msg) {
            warn!(error = %e, "failed to enqueue heartbeat");
        }
        true
    }

    /// Dispatches one inbound application message, per spec §4.E's command
    /// table. Each call is expected to run on its own worker task.
    pub async fn dispatch(self: &Arc<Self>, message: AppMessage) {
        let result = match message.message_type {
            MessageType::HealthCheck => {
                info!("received pong from backend");
                Ok(())
            }
            MessageType::Restart => {
                let reason = String::from_utf8_lossy(&message.payload).into_owned();
                info!(%reason, "restart requested, closing control channel");
                self.cm.shutdown(format!("restart requested: {reason}"));
                Ok(())
            }
            MessageType::RetrieveLogs => self.log_shipper.ship_logs().await,
            MessageType::Configure => self.handle_configure(&message.payload).await,
            MessageType::KeyShard => self.handle_key_shard(&message.payload).await,
            MessageType::OpenWebsocket => self.handle_open_websocket(&message.payload).await,
            MessageType::CloseWebsocket => self.handle_close_websocket(&message.payload).await,
            _ => Err(ControlChannelError::UnrecognisedMessageType),
        };

        if let Err(e) = result {
            error!(error = %e, "control channel command failed");
            let _ = self.runtime_errors.send(e);
        }
    }

    async fn handle_key_shard(&self, payload: &[u8]) -> Result<(), ControlChannelError> {
        let parsed: KeyShardPayload = serde_json::from_slice(payload)
            .map_err(|e| ControlChannelError::MalformedPayload(format!("malformed keyshard payload: {e}")))?;
        self.config_sink.persist_key_shard(&parsed.target_id, &parsed.shard).await
    }

    /// Verifies the attached BZCert and signature before persisting the
    /// service-account configuration (spec §4.E `Configure`): an unsigned or
    /// incorrectly-signed payload is rejected, never written through.
    async fn handle_configure(&self, payload: &[u8]) -> Result<(), ControlChannelError> {
        let parsed: SignedConfigurePayload = serde_json::from_slice(payload)
            .map_err(|e| ControlChannelError::MalformedPayload(format!("malformed configure payload: {e}")))?;

        self.bzcert_verifier
            .verify(&parsed.bzcert, &parsed.config, &parsed.signature)
            .await
            .map_err(|e| ControlChannelError::ConfigureVerificationFailed(e.to_string()))?;

        self.config_sink.persist_service_account_config(&parsed.config).await
    }

    /// Dials a real child Data Connection at the hub-supplied `service_url`
    /// and registers it in the connection map; a background task removes
    /// the entry once the connection manager's own `done` fires, whether
    /// that's from an explicit `CloseWebsocket` or the connection dying on
    /// its own (spec line 226).
    async fn handle_open_websocket(self: &Arc<Self>, payload: &[u8]) -> Result<(), ControlChannelError> {
        let parsed: OpenWebsocketPayload = serde_json::from_slice(payload)
            .map_err(|e| ControlChannelError::MalformedPayload(format!("malformed open payload: {e}")))?;

        let variant = AgentDataVariant::for_service_url(parsed.service_url.clone(), ElapsedCaps::DATA, MessengerConfig::default());
        let cm = ConnectionManager::new(variant)
            .await
            .map_err(|e| ControlChannelError::ChildConnectionFailed(e.to_string()))?;
        let done = cm.done();

        self.connections
            .lock()
            .await
            .insert(parsed.connection_id.clone(), ChildConnection { cm });

        info!(connection_id = %parsed.connection_id, service_url = %parsed.service_url, "opened child data connection");

        let this = self.clone();
        let connection_id = parsed.connection_id.clone();
        tokio::spawn(async move {
            done.cancelled().await;
            this.connections.lock().await.remove(&connection_id);
        });
        Ok(())
    }

    async fn handle_close_websocket(&self, payload: &[u8]) -> Result<(), ControlChannelError> {
        let parsed: CloseWebsocketPayload = serde_json::from_slice(payload)
            .map_err(|e| ControlChannelError::MalformedPayload(format!("malformed close payload: {e}")))?;

        let child = self.connections.lock().await.remove(&parsed.connection_id);
        let Some(child) = child else {
            return Err(ControlChannelError::UnknownConnectionId(parsed.connection_id));
        };
        info!(connection_id = %parsed.connection_id, reason = %parsed.reason, "closing child data connection");
        if let Err(e) = child.cm.close(CLOSE_TIMEOUT).await {
            warn!(error = %e, "error while closing child data connection");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reportable_subject_blocklists_colon_names() {
        assert!(is_reportable_subject("alice@example.com"));
        assert!(!is_reportable_subject("system:serviceaccount:kube-system:default"));
    }
}
