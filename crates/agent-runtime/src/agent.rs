//! The top-level `Agent`: wires Bootstrap, the Control Connection Manager,
//! and the Control Channel together and runs them to completion, the way
//! the teacher's `AlloyRuntime` wires adapters and bots together and runs
//! them under a shutdown signal.

use std::sync::Arc;

use agent_control::bootstrap::Bootstrap;
use agent_control::control_channel::{ClusterUserSource, ConfigSink, ControlChannel, LogShipper};
use agent_control::error::ControlChannelError;
use agent_control::manager::ConnectionManager;
use agent_control::variants::ControlVariant;
use agent_core::signing::{BzCertVerifier, Signer};
use agent_transport::HttpClient;
use jsonwebtoken::DecodingKey;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::RuntimeError;

/// Owns one Control Connection and drives its heartbeat and command
/// dispatch loops until told to stop.
pub struct Agent {
    settings: Arc<Settings>,
    cm: Arc<ConnectionManager<ControlVariant>>,
    control_channel: Arc<ControlChannel>,
    runtime_errors: mpsc::UnboundedReceiver<ControlChannelError>,
    done: CancellationToken,
}

impl Agent {
    /// Bootstraps and dials the Control Connection, then constructs the
    /// Control Channel on top of it. Fails only if the initial dial does
    /// not succeed within the configured connect budget.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        settings: Arc<Settings>,
        http: HttpClient,
        target_id: impl Into<String>,
        signer: Arc<dyn Signer>,
        oidc_key: DecodingKey,
        bzcert_verifier: Arc<dyn BzCertVerifier>,
        config_sink: Arc<dyn ConfigSink>,
        log_shipper: Arc<dyn LogShipper>,
        cluster_users: Option<Arc<dyn ClusterUserSource>>,
    ) -> Result<Self, RuntimeError> {
        let bootstrap = Arc::new(Bootstrap::new(http, target_id, signer, oidc_key));
        let variant = ControlVariant::new(bootstrap, settings.elapsed_caps(), settings.messenger_config());
        let cm = Arc::new(ConnectionManager::new(variant).await?);

        let (control_channel, runtime_errors) =
            ControlChannel::new(cm.clone(), bzcert_verifier, config_sink, log_shipper, cluster_users);

        Ok(Self {
            settings,
            done: cm.done(),
            cm,
            control_channel: Arc::new(control_channel),
            runtime_errors,
        })
    }

    /// Runs the heartbeat and inbound-dispatch loops until the Control
    /// Connection dies or a shutdown signal (Ctrl+C) arrives.
    pub async fn run(mut self) -> Result<(), RuntimeError> {
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut inbound = self.cm.subscribe("control");

        info!("agent is now running, press Ctrl+C to stop");
        loop {
            tokio::select! {
                biased;

                _ = self.done.cancelled() => {
                    info!("control connection is done, stopping");
                    break;
                }

                _ = signal::ctrl_c() => {
                    info!("received Ctrl+C, shutting down");
                    break;
                }

                Some(err) = self.runtime_errors.recv() => {
                    error!(error = %err, "control channel command failed");
                }

                _ = heartbeat.tick() => {
                    self.control_channel.heartbeat_tick().await;
                }

                message = inbound.recv() => {
                    let Some(message) = message else {
                        warn!("control channel inbound queue closed");
                        continue;
                    };
                    let control_channel = self.control_channel.clone();
                    tokio::spawn(async move { control_channel.dispatch(message).await });
                }
            }
        }

        self.close().await
    }

    /// Signals the Control Connection to stop and waits up to the
    /// configured close timeout for it to report not-ready. The Control
    /// Channel shares its connection manager with this `Agent`, so closing
    /// goes through the cancellation signal and readiness flag rather than
    /// consuming the manager outright.
    pub async fn close(self) -> Result<(), RuntimeError> {
        self.done.cancel();
        let mut ready_rx = self.cm.subscribe_ready();
        let _ = tokio::time::timeout(self.settings.control_close_timeout(), async {
            while *ready_rx.borrow() {
                if ready_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        Ok(())
    }
}
