//! The tunable settings schema: every knob the connection core calls out by
//! name, each defaulted to the value named in the protocol's own description.
//!
//! Durations are expressed in their natural unit (seconds or milliseconds) so
//! they deserialize directly from plain environment-variable strings; callers
//! convert with the `*_duration` accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use agent_control::backoff::{BackoffConfig, ElapsedCaps};
use agent_control::messenger::MessengerConfig;

/// Every tunable knob of the connection core, constructed once and shared by
/// `Arc` — never read from a process-global.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Client ping cadence when the send queue is idle (spec §4.B).
    pub ping_interval_secs: u64,
    /// How long without an inbound frame before the Messenger fails the
    /// connection (spec §4.B).
    pub server_ping_timeout_secs: u64,
    /// Upper bound on the Messenger close endgame (spec §4.B).
    pub messenger_endgame_timeout_secs: u64,

    /// Initial backoff delay before the first reconnect attempt (spec §4.D).
    pub backoff_initial_delay_millis: u64,
    /// Backoff growth multiplier.
    pub backoff_multiplier: f64,
    /// Backoff delay ceiling.
    pub backoff_max_delay_secs: u64,
    /// Randomizes each computed delay by ±this fraction.
    pub backoff_jitter_fraction: f64,

    /// Overall elapsed-time budget for the very first connect attempt
    /// (spec §4.D: 30 minutes for Control and Data alike).
    pub elapsed_cap_initial_connect_secs: u64,
    /// Overall elapsed-time budget once a connection has succeeded once
    /// (spec §4.D: 72 hours).
    pub elapsed_cap_reconnect_secs: u64,

    /// Control Channel heartbeat cadence (spec §4.E).
    pub heartbeat_interval_secs: u64,
    /// Control Channel's own close timeout (spec §4.E).
    pub control_close_timeout_secs: u64,

    /// How long the daemon Data Connection waits for `AgentConnected`
    /// before giving up (spec §4.D).
    pub agent_connected_timeout_secs: u64,

    /// MrTAP pipelining cap: max in-flight, unacked Data messages
    /// (spec §4.H).
    pub mrtap_pipeline_cap: usize,
    /// MrTAP recovery attempt cap (spec §4.H).
    pub mrtap_recovery_cap: u32,

    /// Datachannel close flush idle timer (spec §4.G).
    pub datachannel_flush_idle_timeout_millis: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ping_interval_secs: 15,
            server_ping_timeout_secs: 30,
            messenger_endgame_timeout_secs: 60,

            backoff_initial_delay_millis: 500,
            backoff_multiplier: 2.0,
            backoff_max_delay_secs: 10 * 60,
            backoff_jitter_fraction: 0.2,

            elapsed_cap_initial_connect_secs: 30 * 60,
            elapsed_cap_reconnect_secs: 72 * 60 * 60,

            heartbeat_interval_secs: 60,
            control_close_timeout_secs: 10,

            agent_connected_timeout_secs: 60,

            mrtap_pipeline_cap: 8,
            mrtap_recovery_cap: 3,

            datachannel_flush_idle_timeout_millis: 500,
        }
    }
}

impl Settings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn server_ping_timeout(&self) -> Duration {
        Duration::from_secs(self.server_ping_timeout_secs)
    }

    pub fn messenger_endgame_timeout(&self) -> Duration {
        Duration::from_secs(self.messenger_endgame_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn control_close_timeout(&self) -> Duration {
        Duration::from_secs(self.control_close_timeout_secs)
    }

    pub fn agent_connected_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_connected_timeout_secs)
    }

    pub fn datachannel_flush_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.datachannel_flush_idle_timeout_millis)
    }

    /// Builds the Messenger's liveness configuration from these settings.
    pub fn messenger_config(&self) -> MessengerConfig {
        MessengerConfig {
            ping_interval: self.ping_interval(),
            server_ping_timeout: self.server_ping_timeout(),
            endgame_timeout: self.messenger_endgame_timeout(),
        }
    }

    /// Builds the reconnect backoff configuration from these settings.
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(self.backoff_initial_delay_millis),
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_secs(self.backoff_max_delay_secs),
            jitter_fraction: self.backoff_jitter_fraction,
        }
    }

    /// Builds the overall elapsed-time caps shared by every CM variant
    /// (spec §4.D: Data Connections use the same shape as Control).
    pub fn elapsed_caps(&self) -> ElapsedCaps {
        ElapsedCaps {
            initial_connect: Duration::from_secs(self.elapsed_cap_initial_connect_secs),
            reconnect: Duration::from_secs(self.elapsed_cap_reconnect_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.ping_interval(), Duration::from_secs(15));
        assert_eq!(settings.server_ping_timeout(), Duration::from_secs(30));
        assert_eq!(settings.agent_connected_timeout(), Duration::from_secs(60));
        assert_eq!(settings.mrtap_pipeline_cap, 8);
        assert_eq!(settings.mrtap_recovery_cap, 3);
        assert_eq!(settings.datachannel_flush_idle_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn elapsed_caps_match_the_control_connection_shape() {
        let caps = Settings::default().elapsed_caps();
        assert_eq!(caps.initial_connect, Duration::from_secs(30 * 60));
        assert_eq!(caps.reconnect, Duration::from_secs(72 * 60 * 60));
    }
}
