//! The agent-side MrTAP engine (spec §4.H): validates inbound Syn/Data
//! messages against the hash chain and a verified BZCert, and builds the
//! corresponding SynAck/DataAck.

use rand::Rng as _;

use crate::error::MrtapError;
use crate::signing::{BzCertVerifier, Signer, VerifiedBzCert};

use super::types::{DataAckMessage, DataMessage, MrtapMessage, SchemaVersion, SynAckMessage, SynMessage};

/// Hashes a message for hpointer/chain purposes: blake3 over its canonical
/// JSON encoding, hex-encoded.
pub fn hash_message(message: &MrtapMessage) -> Result<String, MrtapError> {
    let bytes = serde_json::to_vec(message).map_err(|_| MrtapError::HashFailure)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Per-datachannel MrTAP state, owned by the agent side of a handshake.
pub struct MrtapEngine {
    agent_public_key: String,
    verifier: std::sync::Arc<dyn BzCertVerifier>,
    signer: std::sync::Arc<dyn Signer>,
    /// Set once a Syn validates; required before any Data can be accepted.
    bzcert: Option<VerifiedBzCert>,
    /// The hpointer the next Data message must present.
    expected_hpointer: Option<String>,
    /// Hash of the last message this engine itself produced (ack), used to
    /// build the next ack's hpointer.
    last_ack_hash: Option<String>,
    /// The peer's schema version, observed at Syn time.
    peer_schema_version: Option<SchemaVersion>,
}

impl MrtapEngine {
    pub fn new(
        agent_public_key: impl Into<String>,
        verifier: std::sync::Arc<dyn BzCertVerifier>,
        signer: std::sync::Arc<dyn Signer>,
    ) -> Self {
        Self {
            agent_public_key: agent_public_key.into(),
            verifier,
            signer,
            bzcert: None,
            expected_hpointer: None,
            last_ack_hash: None,
            peer_schema_version: None,
        }
    }

    /// Validates an inbound Syn or Data message. Any other variant is
    /// rejected as [`MrtapError::UnexpectedMessageType`].
    pub async fn validate(&mut self, message: &MrtapMessage) -> Result<(), MrtapError> {
        match message {
            MrtapMessage::Syn(syn) => self.validate_syn(syn).await,
            MrtapMessage::Data(data) => self.validate_data(data, message).await,
            _ => Err(MrtapError::UnexpectedMessageType),
        }
    }

    async fn validate_syn(&mut self, syn: &SynMessage) -> Result<(), MrtapError> {
        let schema_version = SchemaVersion::parse(&syn.schema_version)
            .ok_or_else(|| MrtapError::FailedToParseVersion(syn.schema_version.clone()))?;

        // target_id is only enforced for peers newer than the legacy 1.0 baseline.
        if schema_version > SchemaVersion::new(1, 0) && syn.target_id != self.agent_public_key {
            return Err(MrtapError::TargetIdMismatch);
        }

        let cert_bytes = base64_decode(&syn.bzcert)?;
        let signature = base64_decode(&syn.signature)?;
        let signed_payload = signable_syn_payload(syn);
        let verified = self
            .verifier
            .verify(&cert_bytes, &signed_payload, &signature)
            .await
            .map_err(|e| MrtapError::BzCertVerificationFailed(e.to_string()))?;

        self.bzcert = Some(verified);
        self.peer_schema_version = Some(schema_version);
        self.expected_hpointer = None;
        self.last_ack_hash = None;
        Ok(())
    }

    async fn validate_data(&mut self, data: &DataMessage, raw: &MrtapMessage) -> Result<(), MrtapError> {
        let cert = self.bzcert.as_ref().ok_or(MrtapError::NoValidatedBzCert)?;

        if data.bzcert_hash != cert.cert_hash {
            return Err(MrtapError::BzCertMismatch);
        }
        if cert.is_expired_at(chrono::Utc::now()) {
            return Err(MrtapError::BzCertExpired);
        }

        let signature = hex_decode(&data.signature).map_err(|_| MrtapError::InvalidSignature)?;
        self.verifier
            .verify_signature(&cert.public_key, &signable_data_payload(data), &signature)
            .await
            .map_err(|_| MrtapError::InvalidSignature)?;

        if let Some(expected) = &self.expected_hpointer {
            if &data.hpointer != expected {
                return Err(MrtapError::UnexpectedHpointer);
            }
        }

        let hash = hash_message(raw)?;
        self.expected_hpointer = Some(hash);
        Ok(())
    }

    /// Builds the ack for a just-validated Syn or Data message.
    pub async fn build_ack(
        &mut self,
        message: &MrtapMessage,
        payload: Vec<u8>,
    ) -> Result<MrtapMessage, MrtapError> {
        match message {
            MrtapMessage::Syn(syn) => self.build_syn_ack(syn).await,
            MrtapMessage::Data(data) => self.build_data_ack(data, raw_hash(message)?, payload).await,
            _ => Err(MrtapError::UnexpectedMessageType),
        }
    }

    async fn build_syn_ack(&mut self, syn: &SynMessage) -> Result<MrtapMessage, MrtapError> {
        let hpointer = hash_message(&MrtapMessage::Syn(syn.clone()))?;
        let nonce = match &self.last_ack_hash {
            Some(last) => last.clone(),
            None => fresh_nonce(),
        };
        let schema_version = self.min_schema_version(&syn.schema_version)?;
        let signature = self
            .signer
            .sign(nonce.as_bytes())
            .await
            .map_err(|e| MrtapError::BzCertVerificationFailed(e.to_string()))?;

        let ack = MrtapMessage::SynAck(SynAckMessage {
            schema_version: schema_version.to_string(),
            hpointer,
            nonce,
            signature: hex_encode(&signature),
        });
        self.last_ack_hash = Some(hash_message(&ack)?);
        Ok(ack)
    }

    async fn build_data_ack(
        &mut self,
        data: &DataMessage,
        data_hash: String,
        payload: Vec<u8>,
    ) -> Result<MrtapMessage, MrtapError> {
        let schema_version = self.min_schema_version(&data.schema_version)?;
        let signature = self
            .signer
            .sign(data_hash.as_bytes())
            .await
            .map_err(|e| MrtapError::BzCertVerificationFailed(e.to_string()))?;
        let ack = MrtapMessage::DataAck(DataAckMessage {
            schema_version: schema_version.to_string(),
            hpointer: data_hash,
            payload: base64_encode(&payload),
            signature: hex_encode(&signature),
        });
        self.last_ack_hash = Some(hash_message(&ack)?);
        Ok(ack)
    }

    fn min_schema_version(&self, peer_version: &str) -> Result<SchemaVersion, MrtapError> {
        let peer =
            SchemaVersion::parse(peer_version).ok_or_else(|| MrtapError::FailedToParseVersion(peer_version.to_string()))?;
        // Our own engine speaks up to the pipelining threshold; never claim more.
        Ok(std::cmp::min(peer, SchemaVersion::PIPELINING_THRESHOLD))
    }
}

fn raw_hash(message: &MrtapMessage) -> Result<String, MrtapError> {
    hash_message(message)
}

fn signable_syn_payload(syn: &SynMessage) -> Vec<u8> {
    format!("{}:{}:{}", syn.schema_version, syn.target_id, syn.bzcert).into_bytes()
}

fn signable_data_payload(data: &DataMessage) -> Vec<u8> {
    format!("{}:{}:{}:{}", data.schema_version, data.hpointer, data.bzcert_hash, data.payload).into_bytes()
}

fn fresh_nonce() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, MrtapError> {
    if s.len() % 2 != 0 {
        return Err(MrtapError::InvalidSignature);
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| MrtapError::InvalidSignature))
        .collect()
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Result<Vec<u8>, MrtapError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| MrtapError::BzCertVerificationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::SigningError;
    use async_trait::async_trait;
    use chrono::Duration;

    struct StubVerifier;

    #[async_trait]
    impl BzCertVerifier for StubVerifier {
        async fn verify(
            &self,
            _cert_bytes: &[u8],
            _signed_payload: &[u8],
            _signature: &[u8],
        ) -> Result<VerifiedBzCert, SigningError> {
            Ok(VerifiedBzCert {
                cert_hash: "cert-hash".into(),
                public_key: "client-pub".into(),
                expires_at: chrono::Utc::now() + Duration::hours(1),
                subject: "user@example.com".into(),
            })
        }

        async fn verify_signature(&self, public_key: &str, _signed_payload: &[u8], signature: &[u8]) -> Result<(), SigningError> {
            if public_key == "client-pub" && signature == b"good-sig" {
                Ok(())
            } else {
                Err(SigningError::VerificationFailed("bad signature".into()))
            }
        }
    }

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

    fn engine() -> MrtapEngine {
        MrtapEngine::new("agent-pub", std::sync::Arc::new(StubVerifier), std::sync::Arc::new(StubSigner))
    }

    #[tokio::test]
    async fn happy_syn_then_data_chain() {
        let mut engine = engine();
        let syn = MrtapMessage::Syn(SynMessage {
            schema_version: "2.0".into(),
            target_id: "agent-pub".into(),
            bzcert: base64_encode(b"cert-bytes"),
            signature: base64_encode(b"sig"),
        });
        engine.validate(&syn).await.unwrap();
        let syn_ack = engine.build_ack(&syn, vec![]).await.unwrap();
        let syn_ack_hash = hash_message(&syn_ack).unwrap();

        let data = MrtapMessage::Data(DataMessage {
            schema_version: "1.1".into(),
            hpointer: syn_ack_hash,
            bzcert_hash: "cert-hash".into(),
            payload: base64_encode(b"action-payload"),
            signature: hex_encode(b"good-sig"),
        });
        engine.validate(&data).await.unwrap();
        let data_ack = engine.build_ack(&data, b"ok".to_vec()).await.unwrap();
        assert!(matches!(data_ack, MrtapMessage::DataAck(_)));
    }

    #[tokio::test]
    async fn legacy_syn_ignores_target_id() {
        let mut engine = engine();
        let syn = MrtapMessage::Syn(SynMessage {
            schema_version: "1.0".into(),
            target_id: "anything".into(),
            bzcert: base64_encode(b"cert-bytes"),
            signature: base64_encode(b"sig"),
        });
        assert!(engine.validate(&syn).await.is_ok());
    }

    #[tokio::test]
    async fn data_before_syn_is_rejected() {
        let mut engine = engine();
        let data = MrtapMessage::Data(DataMessage {
            schema_version: "1.1".into(),
            hpointer: "whatever".into(),
            bzcert_hash: "cert-hash".into(),
            payload: base64_encode(b"x"),
            signature: hex_encode(b"good-sig"),
        });
        assert_eq!(engine.validate(&data).await.unwrap_err(), MrtapError::NoValidatedBzCert);
    }

    #[tokio::test]
    async fn wrong_hpointer_is_rejected() {
        let mut engine = engine();
        let syn = MrtapMessage::Syn(SynMessage {
            schema_version: "2.0".into(),
            target_id: "agent-pub".into(),
            bzcert: base64_encode(b"cert-bytes"),
            signature: base64_encode(b"sig"),
        });
        engine.validate(&syn).await.unwrap();
        engine.build_ack(&syn, vec![]).await.unwrap();

        let data = MrtapMessage::Data(DataMessage {
            schema_version: "1.1".into(),
            hpointer: "not-the-right-hash".into(),
            bzcert_hash: "cert-hash".into(),
            payload: base64_encode(b"x"),
            signature: hex_encode(b"good-sig"),
        });
        assert_eq!(engine.validate(&data).await.unwrap_err(), MrtapError::UnexpectedHpointer);
    }

    #[tokio::test]
    async fn data_with_bad_signature_is_rejected() {
        let mut engine = engine();
        let syn = MrtapMessage::Syn(SynMessage {
            schema_version: "2.0".into(),
            target_id: "agent-pub".into(),
            bzcert: base64_encode(b"cert-bytes"),
            signature: base64_encode(b"sig"),
        });
        engine.validate(&syn).await.unwrap();
        let syn_ack = engine.build_ack(&syn, vec![]).await.unwrap();
        let syn_ack_hash = hash_message(&syn_ack).unwrap();

        let data = MrtapMessage::Data(DataMessage {
            schema_version: "1.1".into(),
            hpointer: syn_ack_hash,
            bzcert_hash: "cert-hash".into(),
            payload: base64_encode(b"action-payload"),
            signature: hex_encode(b"forged"),
        });
        assert_eq!(engine.validate(&data).await.unwrap_err(), MrtapError::InvalidSignature);
    }
}
