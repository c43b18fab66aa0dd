//! Datachannel (spec §4.G): the per-session actor that owns one MrTAP
//! handshake, forwards plugin stream output, and flushes its outbound queue
//! on close with a bounded idle timer.

use std::sync::Arc;
use std::time::Duration;

use agent_core::message::{AppMessage, MessageType};
use agent_core::mrtap::{MrtapEngine, MrtapMessage, SchemaVersion};
use async_trait::async_trait;
use base64::Engine;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DatachannelError;

/// How long `close` waits for the output queue to drain (spec §4.G).
pub const FLUSH_IDLE_TIMEOUT: Duration = Duration::from_millis(500);

/// A plugin backing a datachannel's action payloads (shell/db/kube/ssh/web,
/// out of scope here — consumed only by interface).
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn handle_action(&self, payload: &[u8]) -> Vec<u8>;
}

/// A single datachannel: owns the agent-side MrTAP engine for its handshake
/// and ferries decoded Data payloads to its [`Plugin`].
pub struct Datachannel {
    channel_id: String,
    engine: MrtapEngine,
    plugin: Arc<dyn Plugin>,
    outbound: mpsc::UnboundedSender<AppMessage>,
    dying: CancellationToken,
    /// Whether the peer's payloads need the legacy double-quoted-base64
    /// unwrap (spec §4.G "payload quirk").
    payload_clean: bool,
}

impl Datachannel {
    /// Constructs a datachannel from its initial Syn payload; refuses
    /// construction unless that payload is actually a Syn (spec §4.G).
    pub fn new(
        channel_id: impl Into<String>,
        initial_payload: &AppMessage,
        engine: MrtapEngine,
        plugin: Arc<dyn Plugin>,
        outbound: mpsc::UnboundedSender<AppMessage>,
        dying: CancellationToken,
    ) -> Result<Self, DatachannelError> {
        let mrtap: MrtapMessage = serde_json::from_slice(&initial_payload.payload).map_err(|_| DatachannelError::NotASyn)?;
        if !matches!(mrtap, MrtapMessage::Syn(_)) {
            return Err(DatachannelError::NotASyn);
        }

        Ok(Self {
            channel_id: channel_id.into(),
            engine,
            plugin,
            outbound,
            dying,
            payload_clean: true,
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Sets whether this peer's base64 payloads are already clean, derived
    /// from the peer schema version observed at Syn time (peers at or above
    /// 1.1 are clean; older peers double-quote).
    pub fn set_payload_clean(&mut self, peer_schema_version: SchemaVersion) {
        self.payload_clean = peer_schema_version >= SchemaVersion::new(1, 1);
    }

    fn clean_payload(&self, raw: &[u8]) -> Vec<u8> {
        if self.payload_clean {
            return raw.to_vec();
        }
        // Legacy peers wrap the base64 payload in an extra pair of quotes.
        match std::str::from_utf8(raw) {
            Ok(s) => s.trim_matches('"').as_bytes().to_vec(),
            Err(_) => raw.to_vec(),
        }
    }

    /// Processes one inbound application message addressed to this channel.
    pub async fn handle_inbound(&mut self, message: AppMessage) -> Result<(), DatachannelError> {
        if message.message_type != MessageType::Mrtap {
            debug!(channel_id = %self.channel_id, message_type = ?message.message_type, "ignoring non-mrtap inbound message");
            return Ok(());
        }

        let cleaned = self.clean_payload(&message.payload);
        let mrtap: MrtapMessage = serde_json::from_slice(&cleaned).map_err(|_| DatachannelError::NotASyn)?;

        self.engine
            .validate(&mrtap)
            .await
            .map_err(agent_core::error::PipelineError::Mrtap)?;

        let action_payload = match &mrtap {
            MrtapMessage::Data(data) => {
                let decoded = base64::engine::general_purpose::STANDARD.decode(&data.payload).unwrap_or_default();
                self.plugin.handle_action(&decoded).await
            }
            _ => Vec::new(),
        };

        let ack = self
            .engine
            .build_ack(&mrtap, action_payload)
            .await
            .map_err(agent_core::error::PipelineError::Mrtap)?;

        let ack_bytes = serde_json::to_vec(&ack).map_err(|_| DatachannelError::NotASyn)?;
        let reply = AppMessage::new(self.channel_id.clone(), MessageType::Mrtap, "1.1", ack_bytes);
        let _ = self.outbound.send(reply);
        Ok(())
    }

    /// Flushes any still-queued output with a bounded idle timer, then
    /// signals the parent that this channel is done.
    pub async fn close(self, mut pending: mpsc::UnboundedReceiver<AppMessage>) {
        loop {
            match tokio::time::timeout(FLUSH_IDLE_TIMEOUT, pending.recv()).await {
                Ok(Some(message)) => {
                    let _ = self.outbound.send(message);
                }
                Ok(None) | Err(_) => break,
            }
        }
        info!(channel_id = %self.channel_id, "datachannel flushed and closing");
        self.dying.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::signing::{BzCertVerifier, Signer, SigningError, VerifiedBzCert};

    struct NoopSigner;
    #[async_trait]
    impl Signer for NoopSigner {
        async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError> {
            Ok(message.to_vec())
        }
        fn public_key(&self) -> String {
            "agent-pub".into()
        }
    }

    struct NoopVerifier;
    #[async_trait]
    impl BzCertVerifier for NoopVerifier {
        async fn verify(&self, _cert: &[u8], _payload: &[u8], _sig: &[u8]) -> Result<VerifiedBzCert, SigningError> {
            Ok(VerifiedBzCert {
                cert_hash: "hash".into(),
                public_key: "pub".into(),
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
                subject: "user".into(),
            })
        }

        async fn verify_signature(&self, _public_key: &str, _payload: &[u8], _sig: &[u8]) -> Result<(), SigningError> {
            Ok(())
        }
    }

    struct EchoPlugin;
    #[async_trait]
    impl Plugin for EchoPlugin {
        async fn handle_action(&self, payload: &[u8]) -> Vec<u8> {
            payload.to_vec()
        }
    }

    fn syn_app_message() -> AppMessage {
        let syn = MrtapMessage::Syn(agent_core::mrtap::SynMessage {
            schema_version: "1.1".into(),
            target_id: "agent-pub".into(),
            bzcert: "cert".into(),
            signature: "sig".into(),
        });
        let bytes = serde_json::to_vec(&syn).unwrap();
        AppMessage::new("chan-1", MessageType::Mrtap, "1.1", bytes)
    }

    #[test]
    fn construction_requires_a_syn_payload() {
        let not_syn = AppMessage::new("chan-1", MessageType::Mrtap, "1.1", b"{}".to_vec());
        let engine = MrtapEngine::new("agent-pub", Arc::new(NoopVerifier), Arc::new(NoopSigner));
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = Datachannel::new("chan-1", &not_syn, engine, Arc::new(EchoPlugin), tx, CancellationToken::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn construction_succeeds_with_a_syn_payload() {
        let syn_msg = syn_app_message();
        let engine = MrtapEngine::new("agent-pub", Arc::new(NoopVerifier), Arc::new(NoopSigner));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = Datachannel::new("chan-1", &syn_msg, engine, Arc::new(EchoPlugin), tx, CancellationToken::new()).unwrap();

        channel.handle_inbound(syn_msg).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.message_type, MessageType::Mrtap);
    }
}
