//! The agent-side Data Connection variant (spec §4.D): no agent-ready
//! gating (the agent *is* the agent), same reconnect shape as Control.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backoff::ElapsedCaps;
use crate::bootstrap::Bootstrap;
use crate::error::ManagerError;
use crate::manager::CmVariant;
use crate::messenger::MessengerConfig;
use crate::target::{AgentDataSelector, TargetSelector};

/// Where this variant's transport URL comes from.
enum DialSource {
    /// Discovered through the normal `hub/agent` bootstrap call.
    Bootstrap(Arc<Bootstrap>),
    /// Dialed directly at a URL the caller already has (spec: `OpenWebsocket`
    /// child Data Connections dial the `service_url` the hub handed down,
    /// not a freshly bootstrapped one).
    Direct(String),
}

pub struct AgentDataVariant {
    dial: DialSource,
    elapsed_caps: ElapsedCaps,
    messenger_config: MessengerConfig,
}

impl AgentDataVariant {
    pub fn new(bootstrap: Arc<Bootstrap>, elapsed_caps: ElapsedCaps, messenger_config: MessengerConfig) -> Self {
        Self {
            dial: DialSource::Bootstrap(bootstrap),
            elapsed_caps,
            messenger_config,
        }
    }

    /// Builds a child Data Connection variant that dials `service_url`
    /// directly, for `OpenWebsocket`'s on-demand connections.
    pub fn for_service_url(service_url: impl Into<String>, elapsed_caps: ElapsedCaps, messenger_config: MessengerConfig) -> Self {
        Self {
            dial: DialSource::Direct(service_url.into()),
            elapsed_caps,
            messenger_config,
        }
    }
}

#[async_trait]
impl CmVariant for AgentDataVariant {
    async fn resolve_dial(&self) -> Result<(String, Option<String>), ManagerError> {
        match &self.dial {
            DialSource::Bootstrap(bootstrap) => bootstrap
                .resolve("hub/agent", "openControlChannel")
                .await
                .map_err(ManagerError::from),
            DialSource::Direct(url) => Ok((url.clone(), None)),
        }
    }

    fn target_selector(&self) -> Arc<dyn TargetSelector> {
        Arc::new(AgentDataSelector)
    }

    fn elapsed_caps(&self) -> ElapsedCaps {
        self.elapsed_caps
    }

    fn messenger_config(&self) -> MessengerConfig {
        self.messenger_config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_variant_dials_the_given_url_verbatim() {
        let variant = AgentDataVariant::for_service_url("wss://example.test/ws/123", ElapsedCaps::DATA, MessengerConfig::default());
        let (url, bearer) = variant.resolve_dial().await.unwrap();
        assert_eq!(url, "wss://example.test/ws/123");
        assert!(bearer.is_none());
    }
}
