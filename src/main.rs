#![allow(async_fn_in_trait)]

pub mod agent;
pub mod command;
pub mod config;
pub mod mqtt;
pub mod network;
pub mod persistence;
pub mod platform;
pub mod session;
pub mod watchdog;

#[cfg(test)]
mod testing;

use crate::agent::{Agent, Shutdown};
use crate::command::CommandDispatcher;
use crate::config::AgentConfig;
use crate::mqtt::config::MqttConfig;
use crate::mqtt::mqtt_handler::MqttHandler;
use crate::mqtt::topics::derive_topics;
use crate::network::radio::HostRadio;
use crate::network::supervisor::NetworkSupervisor;
use crate::network::{SystemResolver, WifiCredentials};
use crate::persistence::config_store::ConfigStore;
use crate::platform::{CommandUpdater, HostStatus, PowerControl, SystemPower};
use crate::session::supervisor::SessionSupervisor;
use crate::watchdog::{Watchdog, WatchdogTimer};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

// Matches the mDNS query timeout of the gateway lookup
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let settings = AgentConfig::load(&AgentConfig::default_path()).await?;
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let store = ConfigStore::new(&settings.device_config);
    if let Some(marker) = &settings.device.reset_marker {
        agent::consume_reset_marker(&store, marker).await;
    }
    let config = tokio::select! {
        config = agent::wait_for_provisioning(&store, settings.device.provisioning_poll()) => config,
        _ = cancel.cancelled() => {
            info!("Stopped before provisioning completed");
            return Ok(());
        }
    };

    let identity = config
        .identity()
        .ok_or_else(|| eyre!("Provisioned config is missing the device identity"))?;
    let credentials = WifiCredentials::from_config(&config)
        .ok_or_else(|| eyre!("Provisioned config is missing Wi-Fi credentials"))?;
    let power: Arc<dyn PowerControl> = SystemPower::new(settings.device.reboot_command.clone());

    let timer = WatchdogTimer::new();
    let publish_interval = config.publish_interval();
    match Watchdog::limit_for(publish_interval, settings.watchdog.multiplier) {
        Some(limit) => {
            Watchdog::new(timer.clone(), limit, settings.watchdog.check_period())
                .spawn(power.clone(), cancel.clone());
        }
        None => warn!("Publish interval is zero, watchdog disabled"),
    }

    let radio = if settings.wifi.enabled {
        HostRadio::Nmcli {
            interface: settings.wifi.interface.clone(),
        }
    } else {
        HostRadio::Wired
    };
    let network = NetworkSupervisor::new(radio, credentials, settings.wifi.clone());

    let resolver = SystemResolver::new(RESOLVE_TIMEOUT);
    let mqtt = MqttConfig::for_device(&identity, &settings);
    info!("Broker connection: {:?}", mqtt);
    let topics = derive_topics(&identity.org, &identity.dev_type, &identity.dev_id);
    info!("Using {} topics", topics.mode);
    let broker = MqttHandler::new(
        settings.broker.poll_window(),
        settings.broker.ack_timeout(),
    );
    let session = SessionSupervisor::new(
        broker,
        resolver.clone(),
        mqtt,
        topics,
        settings.broker.retry_backoff(),
        publish_interval,
        timer,
    );

    let dispatcher = CommandDispatcher::new(
        store,
        power,
        resolver,
        CommandUpdater::new(settings.device.update_command.clone()),
    );

    let agent = Agent::new(network, session, dispatcher, config, HostStatus::new());
    match agent.run(cancel.clone()).await {
        Shutdown::Cancelled => info!("Agent stopped"),
        Shutdown::Rebooting => info!("Agent stopped for reboot"),
    }
    cancel.cancel();

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|value| value.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!("Unable to listen for SIGTERM: {}", e);
                return;
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Unable to listen for Ctrl-C: {}", e);
                    return;
                }
            }
            _ = terminate.recv() => {}
        }

        info!("Shutdown requested");
        cancel.cancel();
    });
}
