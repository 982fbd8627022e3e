//! Top-level wiring: the cooperative main loop.
//!
//! Each iteration makes sure the link is up, brings the broker session to Ready if it
//! is not, dispatches at most one inbound message and publishes at most one telemetry
//! document. Nothing in here ever gives up; a loop that stops making progress is the
//! watchdog's business.

use crate::command::{CommandDispatcher, DeviceApp, Dispatch, DispatchContext};
use crate::mqtt::Broker;
use crate::network::supervisor::{LinkStatus, NetworkSupervisor};
use crate::network::{Resolver, WifiRadio};
use crate::persistence::config_store::ConfigStore;
use crate::persistence::DeviceConfig;
use crate::platform::FirmwareUpdater;
use crate::session::supervisor::SessionSupervisor;
use crate::session::SessionState;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Cancelled,
    Rebooting,
}

pub struct Agent<R, B, N, F, A>
where
    R: WifiRadio,
{
    network: NetworkSupervisor<R>,
    session: SessionSupervisor<B, N>,
    dispatcher: CommandDispatcher<N, F>,
    config: DeviceConfig,
    app: A,
}

impl<R, B, N, F, A> Agent<R, B, N, F, A>
where
    R: WifiRadio,
    B: Broker,
    N: Resolver,
    F: FirmwareUpdater,
    A: DeviceApp,
{
    pub fn new(
        network: NetworkSupervisor<R>,
        session: SessionSupervisor<B, N>,
        dispatcher: CommandDispatcher<N, F>,
        config: DeviceConfig,
        app: A,
    ) -> Self {
        Self {
            network,
            session,
            dispatcher,
            config,
            app,
        }
    }

    /// One main loop iteration. Returns `Some` once the agent should stop.
    pub async fn tick(&mut self) -> Option<Shutdown> {
        if self.network.ensure_up().await == LinkStatus::Recovered
            && self.session.state() != SessionState::Disconnected
        {
            self.session.on_network_down().await;
        }

        if !self.network.is_up() {
            return None;
        }
        if !self.session.is_ready() {
            if let Err(e) = self.session.establish(&self.config.meta).await {
                warn!("Broker session not established: {}", e);
                // the failure may be the link going away underneath us
                self.network.verify_soon();
                return None;
            }
        }

        match self.session.poll_inbound().await {
            Some(raw) => {
                let ctx = DispatchContext {
                    config: &mut self.config,
                    uplink: &mut self.session,
                    app: &mut self.app,
                };
                if self.dispatcher.dispatch(&raw, ctx).await == Dispatch::Rebooting {
                    return Some(Shutdown::Rebooting);
                }
            }
            None if !self.session.is_ready() => self.network.verify_soon(),
            None => {}
        }

        self.session.publish_telemetry_if_due(&mut self.app).await;
        None
    }

    /// Runs until cancelled or a command reboots the device.
    pub async fn run(mut self, cancel: CancellationToken) -> Shutdown {
        info!("Agent running");
        let shutdown = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Shutdown::Cancelled,
                step = self.tick() => {
                    if let Some(shutdown) = step {
                        break shutdown;
                    }
                }
            }
        };

        self.session.close().await;
        shutdown
    }
}

/// Wipes the device config when the factory-reset marker exists, then removes the
/// marker so the reset happens once. Returns whether a reset was performed.
pub async fn consume_reset_marker(store: &ConfigStore, marker: &Path) -> bool {
    match tokio::fs::try_exists(marker).await {
        Ok(true) => {}
        Ok(false) => return false,
        Err(e) => {
            warn!("Unable to check reset marker {}: {}", marker.display(), e);
            return false;
        }
    }

    warn!("Factory reset requested by {}", marker.display());
    if let Err(e) = store.reset().await {
        error!("Factory reset could not persist: {}", e);
    }
    if let Err(e) = tokio::fs::remove_file(marker).await {
        error!("Unable to remove reset marker {}: {}", marker.display(), e);
    }
    true
}

/// Returns a provisioned device config, waiting for the provisioning portal to write
/// one if needed. An unprovisioned blob is reset to the empty default first.
pub async fn wait_for_provisioning(store: &ConfigStore, poll: Duration) -> DeviceConfig {
    let config = store.load().await;
    if config.is_provisioned() {
        return config;
    }

    warn!(
        "Device is not provisioned, waiting for configuration at {}",
        store.path().display()
    );
    if let Err(e) = store.reset().await {
        error!("Unable to reset device config: {}", e);
    }

    loop {
        tokio::time::sleep(poll).await;
        let config = store.load().await;
        if config.is_provisioned() {
            info!("Device provisioned");
            return config;
        }
    }
}
