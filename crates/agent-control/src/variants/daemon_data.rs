//! The daemon-side Data Connection variant (spec §4.D): gates the send
//! queue on an `AgentConnected` rendezvous, survives reconnect with its
//! broker intact, and classifies `CloseConnection` reasons into typed exit
//! codes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use agent_core::message::{AppMessage, MessageType};

use crate::backoff::ElapsedCaps;
use crate::bootstrap::Bootstrap;
use crate::error::{CloseClassification, ManagerError};
use crate::manager::CmVariant;
use crate::messenger::MessengerConfig;
use crate::target::{DaemonDataSelector, TargetSelector};

/// How long the daemon waits for `AgentConnected` before giving up (spec §4.D).
pub const AGENT_CONNECTED_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DaemonDataVariant {
    bootstrap: Arc<Bootstrap>,
    elapsed_caps: ElapsedCaps,
    messenger_config: MessengerConfig,
    agent_connected_timeout: Duration,
}

impl DaemonDataVariant {
    pub fn new(bootstrap: Arc<Bootstrap>, elapsed_caps: ElapsedCaps, messenger_config: MessengerConfig, agent_connected_timeout: Duration) -> Self {
        Self {
            bootstrap,
            elapsed_caps,
            messenger_config,
            agent_connected_timeout,
        }
    }

    /// Exposed for tests that want a shorter rendezvous window, everything
    /// else at its default.
    pub fn with_agent_connected_timeout(bootstrap: Arc<Bootstrap>, timeout: Duration) -> Self {
        Self::new(bootstrap, ElapsedCaps::DATA, MessengerConfig::default(), timeout)
    }

    /// Classifies an inbound `CloseConnection{reason}` string (spec §4.D, §6).
    pub fn classify_close(reason: &str) -> CloseClassification {
        CloseClassification::classify(reason)
    }
}

#[async_trait]
impl CmVariant for DaemonDataVariant {
    async fn resolve_dial(&self) -> Result<(String, Option<String>), ManagerError> {
        self.bootstrap
            .resolve("hub/daemon", "openControlChannel")
            .await
            .map_err(ManagerError::from)
    }

    fn target_selector(&self) -> Arc<dyn TargetSelector> {
        Arc::new(DaemonDataSelector)
    }

    fn elapsed_caps(&self) -> ElapsedCaps {
        self.elapsed_caps
    }

    fn messenger_config(&self) -> MessengerConfig {
        self.messenger_config.clone()
    }

    fn agent_ready_timeout(&self) -> Option<Duration> {
        Some(self.agent_connected_timeout)
    }

    fn broker_survives_reconnect(&self) -> bool {
        true
    }

    fn classify_close(&self, reason: &str) -> Option<CloseClassification> {
        Some(Self::classify_close(reason))
    }

    fn final_close_message(&self, reason: &str) -> Option<AppMessage> {
        Some(AppMessage::new("daemon", MessageType::CloseAgentWebsocket, "1.0", reason.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_prefixes() {
        assert_eq!(DaemonDataVariant::classify_close("policy_edited: x"), CloseClassification::PolicyEdited);
        assert_eq!(DaemonDataVariant::classify_close("policy_deleted: x"), CloseClassification::PolicyDeleted);
        assert_eq!(DaemonDataVariant::classify_close("idle_timeout"), CloseClassification::IdleTimeout);
        assert_eq!(DaemonDataVariant::classify_close("something else"), CloseClassification::Other);
    }
}
