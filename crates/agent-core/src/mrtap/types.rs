//! MrTAP wire message types (spec §3, §4.H): a hash-chained handshake of
//! Syn → SynAck → Data → DataAck, each message's `hpointer` binding it to
//! the hash of the message it answers.

use serde::{Deserialize, Serialize};

/// A `(major, minor)` schema version, compared with the ordering the spec
/// needs: simple dotted-pair comparisons against fixed thresholds, never
/// arbitrary semver ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The version at which daemon-side pipelining became available.
    pub const PIPELINING_THRESHOLD: SchemaVersion = SchemaVersion::new(1, 1);

    pub fn parse(s: &str) -> Option<Self> {
        let (major, minor) = s.split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The MrTAP handshake/data message sum type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MrtapMessage {
    Syn(SynMessage),
    SynAck(SynAckMessage),
    Data(DataMessage),
    DataAck(DataAckMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynMessage {
    pub schema_version: String,
    pub target_id: String,
    /// base64-encoded BZCert bytes, opaque to this layer.
    pub bzcert: String,
    /// Signature over the canonical Syn payload, verified against the
    /// BZCert's embedded key.
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynAckMessage {
    pub schema_version: String,
    /// Hash of the Syn this acks.
    pub hpointer: String,
    pub nonce: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMessage {
    pub schema_version: String,
    /// Hash of the SynAck (first Data) or prior DataAck (subsequent Data)
    /// this continues the chain from.
    pub hpointer: String,
    /// Hash of the BZCert validated at Syn time, checked for consistency.
    pub bzcert_hash: String,
    /// Opaque action payload, interpreted by the Datachannel/Plugin layer.
    pub payload: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataAckMessage {
    pub schema_version: String,
    /// Hash of the Data this acks.
    pub hpointer: String,
    pub payload: String,
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_version() {
        assert_eq!(SchemaVersion::parse("1.1"), Some(SchemaVersion::new(1, 1)));
        assert_eq!(SchemaVersion::parse("bogus"), None);
    }

    #[test]
    fn orders_by_major_then_minor() {
        assert!(SchemaVersion::new(1, 0) < SchemaVersion::new(1, 1));
        assert!(SchemaVersion::new(1, 9) < SchemaVersion::new(2, 0));
    }

    #[test]
    fn tagged_enum_round_trips() {
        let msg = MrtapMessage::Syn(SynMessage {
            schema_version: "1.1".into(),
            target_id: "agent-pubkey".into(),
            bzcert: "base64cert".into(),
            signature: "sig".into(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"Syn\""));
        let back: MrtapMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, MrtapMessage::Syn(_)));
    }
}
