//! The Frame Message sum type (spec §3) carried over the wire, one JSON object
//! per frame, separated by the record-separator byte `0x1E` (spec §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The literal first frame sent right after the transport comes up.
pub const VERSION_HANDSHAKE: &str = r#"{"protocol":"json","version":1}"#;

/// The SignalR-style frame sum type (spec §3).
///
/// `type` is the SignalR hub-protocol discriminant: `1` = Invocation,
/// `3` = Completion, `6` = Ping, `7` = Close. Other numeric types are decoded
/// into [`Frame::Other`] and ignored by the Messenger pump.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Invocation(InvocationFrame),
    Completion(CompletionFrame),
    Ping(PingFrame),
    Close(CloseFrame),
    Other(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationFrame {
    #[serde(rename = "type")]
    pub kind: InvocationTag,
    pub target: String,
    pub arguments: Vec<Value>,
    #[serde(rename = "invocationId")]
    pub invocation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionFrame {
    #[serde(rename = "type")]
    pub kind: CompletionTag,
    #[serde(rename = "invocationId")]
    pub invocation_id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingFrame {
    #[serde(rename = "type")]
    pub kind: PingTag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseFrame {
    #[serde(rename = "type")]
    pub kind: CloseTag,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "allowReconnect")]
    pub allow_reconnect: bool,
}

/// Tag newtypes pin each frame variant to its SignalR discriminant so
/// `#[serde(untagged)]` dispatches unambiguously on `type` without a manual
/// `Deserialize` impl.
macro_rules! tag {
    ($name:ident, $value:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name;

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_u8($value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let v = u8::deserialize(d)?;
                if v == $value {
                    Ok($name)
                } else {
                    Err(serde::de::Error::custom(format!(
                        "expected frame type {}, got {}",
                        $value, v
                    )))
                }
            }
        }
    };
}

tag!(InvocationTag, 1);
tag!(CompletionTag, 3);
tag!(PingTag, 6);
tag!(CloseTag, 7);

impl InvocationFrame {
    pub fn new(target: impl Into<String>, arguments: Vec<Value>, invocation_id: impl Into<String>) -> Self {
        Self {
            kind: InvocationTag,
            target: target.into(),
            arguments,
            invocation_id: invocation_id.into(),
        }
    }
}

impl PingFrame {
    pub fn new() -> Self {
        Self { kind: PingTag }
    }
}

impl Default for PingFrame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_round_trips() {
        let frame = Frame::Invocation(InvocationFrame::new(
            "Heartbeat",
            vec![serde_json::json!({"hello": "world"})],
            "inv-1",
        ));
        let text = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&text).unwrap();
        match back {
            Frame::Invocation(f) => {
                assert_eq!(f.target, "Heartbeat");
                assert_eq!(f.invocation_id, "inv-1");
            }
            _ => panic!("expected Invocation"),
        }
    }

    #[test]
    fn ping_round_trips() {
        let frame = Frame::Ping(PingFrame::new());
        let text = serde_json::to_string(&frame).unwrap();
        assert!(matches!(
            serde_json::from_str::<Frame>(&text).unwrap(),
            Frame::Ping(_)
        ));
    }

    #[test]
    fn completion_with_error_round_trips() {
        let frame = Frame::Completion(CompletionFrame {
            kind: CompletionTag,
            invocation_id: Some("inv-1".into()),
            result: None,
            error: Some("boom".into()),
        });
        let text = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&text).unwrap();
        match back {
            Frame::Completion(c) => assert_eq!(c.error.as_deref(), Some("boom")),
            _ => panic!("expected Completion"),
        }
    }
}
