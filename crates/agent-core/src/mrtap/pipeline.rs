//! The daemon-side MrTAP peer (spec §4.H): builds the outbound Syn, turns
//! `inbox(action, payload)` calls into chained Data messages, pipelines them
//! up to a cap for peers that support it, and recovers the chain after an
//! agent-reported error.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::PipelineError;
use crate::signing::Signer;

use super::engine::hash_message;
use super::types::{DataMessage, MrtapMessage, SchemaVersion, SynMessage};

/// Default simultaneous in-flight Data messages before `inbox` blocks.
pub const DEFAULT_PIPELINE_CAP: usize = 8;

/// Default number of recovery attempts before giving up (spec §4.H).
pub const DEFAULT_RECOVERY_CAP: u32 = 3;

struct InFlightData {
    sequence: u64,
    message: DataMessage,
}

struct State {
    target_id: String,
    signer: Arc<dyn Signer>,
    /// Messages sent but not yet DataAck'd, in send order, keyed by hash.
    pipeline_map: BTreeMap<String, InFlightData>,
    next_sequence: u64,
    /// Hash of the last message this peer sent (SynAck-received or prior Data),
    /// used as the next Data's hpointer.
    chain_tail: Option<String>,
    /// True once a SynAck has validated and Data sends are permitted.
    handshake_complete: bool,
    /// The peer's negotiated schema version, set at SynAck time.
    peer_schema_version: Option<SchemaVersion>,
    recovery_attempts: u32,
}

/// Daemon-side MrTAP peer driving the outbound half of a datachannel's
/// handshake and data chain.
pub struct DaemonMrtapPeer {
    state: Mutex<State>,
    pipeline_semaphore: Semaphore,
    recovery_cap: u32,
}

impl DaemonMrtapPeer {
    pub fn new(target_id: impl Into<String>, signer: Arc<dyn Signer>) -> Self {
        Self::with_caps(target_id, signer, DEFAULT_PIPELINE_CAP, DEFAULT_RECOVERY_CAP)
    }

    pub fn with_caps(
        target_id: impl Into<String>,
        signer: Arc<dyn Signer>,
        pipeline_cap: usize,
        recovery_cap: u32,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                target_id: target_id.into(),
                signer,
                pipeline_map: BTreeMap::new(),
                next_sequence: 0,
                chain_tail: None,
                handshake_complete: false,
                peer_schema_version: None,
                recovery_attempts: 0,
            }),
            pipeline_semaphore: Semaphore::new(pipeline_cap),
            recovery_cap,
        }
    }

    /// Builds the initial Syn to open the handshake.
    pub async fn build_syn(&self, bzcert_b64: impl Into<String>, signature_b64: impl Into<String>) -> MrtapMessage {
        let target_id = self.state.lock().target_id.clone();
        MrtapMessage::Syn(SynMessage {
            schema_version: SchemaVersion::PIPELINING_THRESHOLD.to_string(),
            target_id,
            bzcert: bzcert_b64.into(),
            signature: signature_b64.into(),
        })
    }

    /// Called once the agent's SynAck has been validated; opens the gate for
    /// `inbox`/`recover` and records the chain tail.
    pub fn on_syn_ack_validated(&self, syn_ack_hash: String, peer_schema_version: SchemaVersion) {
        let mut state = self.state.lock();
        state.handshake_complete = true;
        state.chain_tail = Some(syn_ack_hash);
        state.peer_schema_version = Some(peer_schema_version);
    }

    /// True once a SynAck has validated.
    pub fn handshake_complete(&self) -> bool {
        self.state.lock().handshake_complete
    }

    /// Turns an action/payload pair into a Data message chained off the
    /// current tail and enqueues it into the pipeline map, blocking if the
    /// cap is already full. For peers below the pipelining threshold this
    /// degenerates to one-at-a-time: the cap is effectively 1 because the
    /// caller is expected to await the DataAck via [`Self::on_data_ack`]
    /// before calling `inbox` again.
    pub async fn inbox(
        &self,
        bzcert_hash: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<MrtapMessage, PipelineError> {
        if !self.handshake_complete() {
            return Err(PipelineError::HandshakeIncomplete);
        }

        let permit = self
            .pipeline_semaphore
            .acquire()
            .await
            .expect("pipeline semaphore is never closed");
        permit.forget();

        let mut state = self.state.lock();
        let hpointer = state
            .chain_tail
            .clone()
            .ok_or(PipelineError::HandshakeIncomplete)?;
        let schema_version = state
            .peer_schema_version
            .unwrap_or(SchemaVersion::PIPELINING_THRESHOLD)
            .to_string();

        let data = DataMessage {
            schema_version,
            hpointer,
            bzcert_hash: bzcert_hash.into(),
            payload: payload.into(),
            signature: String::new(),
        };
        let message = MrtapMessage::Data(data.clone());
        let hash = hash_message(&message).map_err(PipelineError::Mrtap)?;

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.chain_tail = Some(hash.clone());
        state.pipeline_map.insert(hash, InFlightData { sequence, message: data });

        Ok(message)
    }

    /// Consumes a validated DataAck, freeing one pipeline slot.
    pub fn on_data_ack(&self, data_hash: &str) {
        let mut state = self.state.lock();
        if state.pipeline_map.remove(data_hash).is_some() {
            self.pipeline_semaphore.add_permits(1);
        }
    }

    /// Recovers the chain after an agent-originated error referencing
    /// `error_hash`. Builds a fresh Syn; the caller sends it and, once the
    /// recovery SynAck validates, calls [`Self::resend_after_recovery`] with
    /// the SynAck's nonce to learn which Data messages to retransmit.
    pub async fn recover(
        &self,
        bzcert_b64: impl Into<String>,
        signature_b64: impl Into<String>,
    ) -> Result<MrtapMessage, PipelineError> {
        let mut state = self.state.lock();
        if state.recovery_attempts >= self.recovery_cap {
            return Err(PipelineError::RecoveryCapExceeded(self.recovery_cap));
        }
        state.recovery_attempts += 1;
        state.handshake_complete = false;
        drop(state);
        Ok(self.build_syn(bzcert_b64, signature_b64).await)
    }

    /// Given the recovery SynAck's nonce, resolves which Data messages to
    /// resend: every message strictly after the one the nonce refers to. If
    /// the nonce is unknown to this peer, legacy peers (schema <= 1.0) get
    /// everything resent; newer peers get nothing resent, per the spec's
    /// recovery-determinism property.
    pub fn resend_after_recovery(&self, nonce_hash: &str, peer_schema_version: SchemaVersion) -> Vec<MrtapMessage> {
        let mut state = self.state.lock();
        state.handshake_complete = true;
        state.recovery_attempts = 0;

        let known_sequence = state
            .pipeline_map
            .get(nonce_hash)
            .map(|entry| entry.sequence);

        let resend: Vec<MrtapMessage> = match known_sequence {
            Some(seq) => state
                .pipeline_map
                .values()
                .filter(|entry| entry.sequence > seq)
                .map(|entry| MrtapMessage::Data(entry.message.clone()))
                .collect(),
            None if peer_schema_version <= SchemaVersion::new(1, 0) => state
                .pipeline_map
                .values()
                .map(|entry| MrtapMessage::Data(entry.message.clone()))
                .collect(),
            None => Vec::new(),
        };

        if let Some(last) = resend.last() {
            if let Ok(hash) = hash_message(last) {
                state.chain_tail = Some(hash);
            }
        }

        resend
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().pipeline_map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::SigningError;
    use async_trait::async_trait;

    struct StubSigner;

    #[async_trait]
    impl Signer for StubSigner {
        async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError> {
            Ok(message.to_vec())
        }

        fn public_key(&self) -> String {
            "agent-pub".into()
        }
    }

    fn peer_with_caps(pipeline_cap: usize) -> DaemonMrtapPeer {
        let peer = DaemonMrtapPeer::with_caps("agent-pub", Arc::new(StubSigner), pipeline_cap, DEFAULT_RECOVERY_CAP);
        peer.on_syn_ack_validated("syn-ack-hash".into(), SchemaVersion::new(1, 1));
        peer
    }

    #[tokio::test]
    async fn inbox_rejects_before_handshake() {
        let peer = DaemonMrtapPeer::new("agent-pub", Arc::new(StubSigner));
        let err = peer.inbox("cert-hash", "payload").await.unwrap_err();
        assert!(matches!(err, PipelineError::HandshakeIncomplete));
    }

    #[tokio::test]
    async fn pipeline_chains_linearly() {
        let peer = peer_with_caps(8);
        let mut hpointers = Vec::new();
        for _ in 0..8 {
            let msg = peer.inbox("cert-hash", "payload").await.unwrap();
            if let MrtapMessage::Data(d) = msg {
                hpointers.push(d.hpointer);
            }
        }
        assert_eq!(hpointers.len(), 8);
        assert_eq!(hpointers[0], "syn-ack-hash");
        // Each subsequent hpointer differs from the last (chained, not repeated).
        for pair in hpointers.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(peer.in_flight_count(), 8);
    }

    #[tokio::test]
    async fn call_past_the_cap_blocks_until_an_ack_frees_a_slot() {
        let peer = Arc::new(peer_with_caps(1));
        let first = peer.inbox("cert-hash", "payload").await.unwrap();
        let first_hash = hash_message(&first).unwrap();

        let peer2 = peer.clone();
        let blocked = tokio::spawn(async move { peer2.inbox("cert-hash", "payload-2").await });

        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        peer.on_data_ack(&first_hash);
        let second = blocked.await.unwrap().unwrap();
        assert!(matches!(second, MrtapMessage::Data(_)));
    }

    #[tokio::test]
    async fn recovery_resends_only_after_the_acked_message() {
        let peer = peer_with_caps(8);
        let mut hashes = Vec::new();
        for _ in 0..3 {
            let msg = peer.inbox("cert-hash", "payload").await.unwrap();
            hashes.push(hash_message(&msg).unwrap());
        }
        // Data0 acked; daemon later recovers.
        peer.on_data_ack(&hashes[0]);

        let resent = peer.resend_after_recovery(&hashes[0], SchemaVersion::new(1, 1));
        assert_eq!(resent.len(), 2);
    }

    #[tokio::test]
    async fn unknown_nonce_resends_nothing_for_modern_peers() {
        let peer = peer_with_caps(8);
        peer.inbox("cert-hash", "payload").await.unwrap();
        let resent = peer.resend_after_recovery("unknown-hash", SchemaVersion::new(1, 1));
        assert!(resent.is_empty());
    }

    #[tokio::test]
    async fn unknown_nonce_resends_everything_for_legacy_peers() {
        let peer = peer_with_caps(8);
        peer.inbox("cert-hash", "payload").await.unwrap();
        peer.inbox("cert-hash", "payload").await.unwrap();
        let resent = peer.resend_after_recovery("unknown-hash", SchemaVersion::new(1, 0));
        assert_eq!(resent.len(), 2);
    }

    #[tokio::test]
    async fn recovery_cap_is_enforced() {
        let peer = DaemonMrtapPeer::with_caps("agent-pub", Arc::new(StubSigner), 8, 1);
        peer.recover("cert", "sig").await.unwrap();
        let err = peer.recover("cert", "sig").await.unwrap_err();
        assert!(matches!(err, PipelineError::RecoveryCapExceeded(1)));
    }

}
