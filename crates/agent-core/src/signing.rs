//! External signing/verification collaborators (Glossary: "BZCert", "Signer").
//!
//! MrTAP only *consumes* signature and certificate verification — it never
//! implements the cryptography itself. Callers supply a concrete [`Signer`]
//! (for outbound acks) and [`BzCertVerifier`] (for inbound Syn validation),
//! keeping this crate free of a hard dependency on any one crypto stack.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Signs outbound MrTAP messages with the agent's private key.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Signs `message` and returns the raw signature bytes.
    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError>;

    /// The public key this signer's counterpart verifies against, in
    /// whatever encoding the Backend expects it in (base64 or raw, per
    /// deployment) — MrTAP treats it as an opaque identity string.
    fn public_key(&self) -> String;
}

/// Verifies a BZCert presented in a Syn message and its accompanying
/// signature, without this crate needing to know the certificate format.
#[async_trait]
pub trait BzCertVerifier: Send + Sync {
    /// Verifies `cert_bytes` is well-formed, currently valid, and that
    /// `signature` over `signed_payload` was produced by its embedded key.
    async fn verify(
        &self,
        cert_bytes: &[u8],
        signed_payload: &[u8],
        signature: &[u8],
    ) -> Result<VerifiedBzCert, SigningError>;

    /// Verifies a Data/DataAck-style signature against an already-verified
    /// certificate's public key (spec §4.H: every post-handshake message is
    /// signed, not just the Syn). `public_key` comes from a prior
    /// [`VerifiedBzCert::public_key`], not from the message itself.
    async fn verify_signature(
        &self,
        public_key: &str,
        signed_payload: &[u8],
        signature: &[u8],
    ) -> Result<(), SigningError>;
}

/// The result of a successful BZCert verification, retained for the
/// lifetime of the datachannel it was presented on (spec §4.H: later Data
/// messages are checked against the Syn-time `BzCertMismatch`/expiry).
#[derive(Debug, Clone)]
pub struct VerifiedBzCert {
    /// Stable hash/identifier of the certificate, compared against each
    /// Data message's `bzcert_hash`.
    pub cert_hash: String,
    /// The verified public key bound to this certificate, used to check
    /// subsequent Data/DataAck signatures.
    pub public_key: String,
    /// When this certificate stops being valid.
    pub expires_at: DateTime<Utc>,
    /// Opaque subject identity, surfaced for cluster-user reporting.
    pub subject: String,
}

impl VerifiedBzCert {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("signing failed: {0}")]
    SignFailed(String),
    #[error("certificate verification failed: {0}")]
    VerificationFailed(String),
    #[error("certificate has expired")]
    Expired,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn expiry_check_is_inclusive_of_now() {
        let now = Utc::now();
        let cert = VerifiedBzCert {
            cert_hash: "h".into(),
            public_key: "pk".into(),
            expires_at: now,
            subject: "user@example.com".into(),
        };
        assert!(cert.is_expired_at(now));
        assert!(!cert.is_expired_at(now - Duration::seconds(1)));
    }
}
