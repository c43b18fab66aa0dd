//! The agent-side Control Connection variant (spec §4.D).

use std::sync::Arc;

use async_trait::async_trait;

use crate::backoff::ElapsedCaps;
use crate::bootstrap::Bootstrap;
use crate::error::ManagerError;
use crate::manager::CmVariant;
use crate::messenger::MessengerConfig;
use crate::target::{AgentControlSelector, TargetSelector};

pub struct ControlVariant {
    bootstrap: Arc<Bootstrap>,
    elapsed_caps: ElapsedCaps,
    messenger_config: MessengerConfig,
}

impl ControlVariant {
    pub fn new(bootstrap: Arc<Bootstrap>, elapsed_caps: ElapsedCaps, messenger_config: MessengerConfig) -> Self {
        Self { bootstrap, elapsed_caps, messenger_config }
    }
}

#[async_trait]
impl CmVariant for ControlVariant {
    async fn resolve_dial(&self) -> Result<(String, Option<String>), ManagerError> {
        self.bootstrap
            .resolve("hub/agent-control", "openControlChannel")
            .await
            .map_err(ManagerError::from)
    }

    fn target_selector(&self) -> Arc<dyn TargetSelector> {
        Arc::new(AgentControlSelector)
    }

    fn elapsed_caps(&self) -> ElapsedCaps {
        self.elapsed_caps
    }

    fn messenger_config(&self) -> MessengerConfig {
        self.messenger_config.clone()
    }
}
