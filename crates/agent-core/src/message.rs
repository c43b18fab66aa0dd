//! The Application Message data model (spec §3, wire schema §6).
//!
//! An [`AppMessage`] is the unit of communication the rest of the stack works
//! with: the Messenger (in `agent-control`) encodes/decodes it as the sole
//! argument of an `Invocation` frame, the Broker fans it out by `channel_id`,
//! and the Control Channel / Datachannel consume it by `message_type`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// The legal `messageType` values, closed per spec §3 ("unknown types are
/// errors"). `Mrtap` accepts the legacy `keysplitting` alias on decode and
/// always round-trips back out as `mrtap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Mrtap,
    Stream,
    Error,
    OpenDataChannel,
    CloseDataChannel,
    CloseDaemonWebsocket,
    CloseAgentWebsocket,
    OpenWebsocket,
    CloseWebsocket,
    CloseAllConnections,
    HealthCheck,
    ClusterUsers,
    Restart,
    Configure,
    RetrieveLogs,
    KeyShard,
    GetAgentIdentityToken,
    GetControlChannel,
    OpenControlChannel,
}

impl MessageType {
    /// The canonical wire string for this type (never the legacy alias).
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::Mrtap => "mrtap",
            Self::Stream => "stream",
            Self::Error => "error",
            Self::OpenDataChannel => "openDataChannel",
            Self::CloseDataChannel => "closeDataChannel",
            Self::CloseDaemonWebsocket => "closeDaemonWebsocket",
            Self::CloseAgentWebsocket => "closeAgentWebsocket",
            Self::OpenWebsocket => "openWebsocket",
            Self::CloseWebsocket => "closeWebsocket",
            Self::CloseAllConnections => "closeAllConnections",
            Self::HealthCheck => "healthcheck",
            Self::ClusterUsers => "clusterusers",
            Self::Restart => "restart",
            Self::Configure => "configure",
            Self::RetrieveLogs => "retrievelogs",
            Self::KeyShard => "keyshard",
            Self::GetAgentIdentityToken => "getAgentIdentityToken",
            Self::GetControlChannel => "getControlChannel",
            Self::OpenControlChannel => "openControlChannel",
        }
    }

    /// Parses a wire `messageType`, normalizing the legacy `keysplitting`
    /// alias to [`MessageType::Mrtap`] (spec §3, §8 scenario 8).
    pub fn from_wire_str(s: &str) -> Result<Self, CodecError> {
        Ok(match s {
            "mrtap" | "keysplitting" => Self::Mrtap,
            "stream" => Self::Stream,
            "error" => Self::Error,
            "openDataChannel" => Self::OpenDataChannel,
            "closeDataChannel" => Self::CloseDataChannel,
            "closeDaemonWebsocket" => Self::CloseDaemonWebsocket,
            "closeAgentWebsocket" => Self::CloseAgentWebsocket,
            "openWebsocket" => Self::OpenWebsocket,
            "closeWebsocket" => Self::CloseWebsocket,
            "closeAllConnections" => Self::CloseAllConnections,
            "healthcheck" => Self::HealthCheck,
            "clusterusers" => Self::ClusterUsers,
            "restart" => Self::Restart,
            "configure" => Self::Configure,
            "retrievelogs" => Self::RetrieveLogs,
            "keyshard" => Self::KeyShard,
            "getAgentIdentityToken" => Self::GetAgentIdentityToken,
            "getControlChannel" => Self::GetControlChannel,
            "openControlChannel" => Self::OpenControlChannel,
            other => return Err(CodecError::UnknownMessageType(other.to_string())),
        })
    }
}

/// The wire JSON shape of an application message (spec §6):
/// `{"channelId", "messageType", "schemaVersion", "messagePayload"}` with the
/// payload base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireAppMessage {
    #[serde(rename = "channelId")]
    channel_id: String,
    #[serde(rename = "messageType")]
    message_type: String,
    #[serde(rename = "schemaVersion")]
    schema_version: String,
    #[serde(rename = "messagePayload")]
    message_payload: String,
}

/// An Application Message: `(channel_id, message_type, schema_version, payload)`
/// per spec §3.
#[derive(Debug, Clone)]
pub struct AppMessage {
    pub channel_id: String,
    pub message_type: MessageType,
    pub schema_version: String,
    pub payload: Vec<u8>,
}

impl AppMessage {
    pub fn new(
        channel_id: impl Into<String>,
        message_type: MessageType,
        schema_version: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            message_type,
            schema_version: schema_version.into(),
            payload,
        }
    }

    /// Encodes this message to the wire JSON value used as an Invocation's
    /// sole argument.
    pub fn to_wire_json(&self) -> Result<serde_json::Value, CodecError> {
        let wire = WireAppMessage {
            channel_id: self.channel_id.clone(),
            message_type: self.message_type.as_wire_str().to_string(),
            schema_version: self.schema_version.clone(),
            message_payload: BASE64.encode(&self.payload),
        };
        Ok(serde_json::to_value(wire)?)
    }

    /// Decodes a wire JSON value (an Invocation argument) into an `AppMessage`.
    pub fn from_wire_json(value: &serde_json::Value) -> Result<Self, CodecError> {
        let wire: WireAppMessage = serde_json::from_value(value.clone())?;
        let message_type = MessageType::from_wire_str(&wire.message_type)?;
        let payload = BASE64.decode(wire.message_payload)?;
        Ok(Self {
            channel_id: wire.channel_id,
            message_type,
            schema_version: wire.schema_version,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_json() {
        let msg = AppMessage::new("chan-1", MessageType::Stream, "2.0", b"hello".to_vec());
        let json = msg.to_wire_json().unwrap();
        let back = AppMessage::from_wire_json(&json).unwrap();
        assert_eq!(back.channel_id, "chan-1");
        assert_eq!(back.message_type, MessageType::Stream);
        assert_eq!(back.schema_version, "2.0");
        assert_eq!(back.payload, b"hello");
    }

    #[test]
    fn normalizes_legacy_keysplitting_alias() {
        let value = serde_json::json!({
            "channelId": "chan-1",
            "messageType": "keysplitting",
            "schemaVersion": "1.0",
            "messagePayload": BASE64.encode(b"{}"),
        });
        let msg = AppMessage::from_wire_json(&value).unwrap();
        assert_eq!(msg.message_type, MessageType::Mrtap);
        // Canonical form always round-trips back out as "mrtap".
        let re_encoded = msg.to_wire_json().unwrap();
        assert_eq!(re_encoded["messageType"], "mrtap");
    }

    #[test]
    fn rejects_unknown_message_type() {
        let value = serde_json::json!({
            "channelId": "chan-1",
            "messageType": "bogus",
            "schemaVersion": "1.0",
            "messagePayload": BASE64.encode(b"{}"),
        });
        assert!(matches!(
            AppMessage::from_wire_json(&value),
            Err(CodecError::UnknownMessageType(ref t)) if t == "bogus"
        ));
    }
}

