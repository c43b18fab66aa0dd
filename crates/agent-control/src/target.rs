//! Target selection: maps an outbound [`AppMessage`] to the SignalR hub
//! target its Invocation should be sent to. Pluggable because the legal set
//! differs per Connection Manager variant (spec §4.B).

use agent_core::message::{AppMessage, MessageType};

use crate::error::MessengerError;

/// Chooses the hub target for an outbound application message.
pub trait TargetSelector: Send + Sync {
    fn select(&self, message: &AppMessage) -> Result<&'static str, MessengerError>;
}

/// Agent-side Data Connection target table.
#[derive(Debug, Default)]
pub struct AgentDataSelector;

impl TargetSelector for AgentDataSelector {
    fn select(&self, message: &AppMessage) -> Result<&'static str, MessengerError> {
        match message.message_type {
            MessageType::CloseDaemonWebsocket => Ok("CloseDaemonWebsocketV1"),
            MessageType::Mrtap | MessageType::Stream | MessageType::Error => Ok("ResponseAgentToBastionV1"),
            _ => Err(MessengerError::NoTargetForMessage),
        }
    }
}

/// Agent-side Control Connection target table.
#[derive(Debug, Default)]
pub struct AgentControlSelector;

impl TargetSelector for AgentControlSelector {
    fn select(&self, message: &AppMessage) -> Result<&'static str, MessengerError> {
        match message.message_type {
            MessageType::HealthCheck => Ok("Heartbeat"),
            MessageType::ClusterUsers => Ok("ClusterUsers"),
            _ => Err(MessengerError::NoTargetForMessage),
        }
    }
}

/// Daemon-side Data Connection target table.
#[derive(Debug, Default)]
pub struct DaemonDataSelector;

impl TargetSelector for DaemonDataSelector {
    fn select(&self, message: &AppMessage) -> Result<&'static str, MessengerError> {
        match message.message_type {
            MessageType::Mrtap => Ok("RequestDaemonToBastionV1"),
            MessageType::OpenDataChannel => Ok("OpenDataChannelDaemonToBastionV1"),
            MessageType::CloseDataChannel => Ok("CloseDataChannelDaemonToBastionV1"),
            MessageType::CloseAgentWebsocket => Ok("CloseAgentWebsocketV1"),
            _ => Err(MessengerError::NoTargetForMessage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(t: MessageType) -> AppMessage {
        AppMessage::new("chan", t, "1.0", vec![])
    }

    #[test]
    fn agent_data_selector_matches_the_spec_table() {
        let s = AgentDataSelector;
        assert_eq!(s.select(&msg(MessageType::CloseDaemonWebsocket)).unwrap(), "CloseDaemonWebsocketV1");
        assert_eq!(s.select(&msg(MessageType::Stream)).unwrap(), "ResponseAgentToBastionV1");
        assert!(s.select(&msg(MessageType::Restart)).is_err());
    }

    #[test]
    fn agent_control_selector_matches_the_spec_table() {
        let s = AgentControlSelector;
        assert_eq!(s.select(&msg(MessageType::HealthCheck)).unwrap(), "Heartbeat");
        assert_eq!(s.select(&msg(MessageType::ClusterUsers)).unwrap(), "ClusterUsers");
        assert!(s.select(&msg(MessageType::Mrtap)).is_err());
    }

    #[test]
    fn daemon_data_selector_matches_the_spec_table() {
        let s = DaemonDataSelector;
        assert_eq!(s.select(&msg(MessageType::Mrtap)).unwrap(), "RequestDaemonToBastionV1");
        assert_eq!(s.select(&msg(MessageType::OpenDataChannel)).unwrap(), "OpenDataChannelDaemonToBastionV1");
        assert_eq!(s.select(&msg(MessageType::CloseDataChannel)).unwrap(), "CloseDataChannelDaemonToBastionV1");
        assert_eq!(s.select(&msg(MessageType::CloseAgentWebsocket)).unwrap(), "CloseAgentWebsocketV1");
        assert!(s.select(&msg(MessageType::HealthCheck)).is_err());
    }
}
