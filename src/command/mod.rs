//! # Command Dispatch Module
//!
//! Turns inbound broker messages into side effects. Routing is by substring match on
//! the topic, first match wins, so the same rules cover direct-cloud and gateway
//! topic forms:
//!
//! | topic contains          | action                                              |
//! |-------------------------|-----------------------------------------------------|
//! | `/response`             | nothing                                             |
//! | `/device/reboot`        | hard reboot                                         |
//! | `/device/factory_reset` | reset and persist the device config, hard reboot    |
//! | `/device/update`        | replace `meta` from `metadata` fields, persist      |
//! | `/cmd/`                 | `upgrade` / `config` built-ins, then the device app |
//!
//! Commands never fail the agent. Bad payloads are logged and dropped, bad arguments
//! are reported back on the info topic.

use crate::mqtt::message_manager::{self, InboundCommand};
use crate::mqtt::RawMessage;
use crate::network::Resolver;
use crate::persistence::config_store::ConfigStore;
use crate::persistence::DeviceConfig;
use crate::platform::{FirmwareUpdater, PowerControl, UpdateOutcome};
use crate::session::SessionError;
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const COMPILE_DATE: &str = env!("AGENT_COMPILE_DATE");

const OTA_INFO_ERROR: &str = "OTA Information Error";
const OTA_NO_UPDATE: &str = "[update] Update no Update.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Response,
    Reboot,
    FactoryReset,
    UpdateMetadata,
    Command,
    Unknown,
}

impl Route {
    pub fn classify(topic: &str) -> Self {
        if topic.contains("/response") {
            Route::Response
        } else if topic.contains("/device/reboot") {
            Route::Reboot
        } else if topic.contains("/device/factory_reset") {
            Route::FactoryReset
        } else if topic.contains("/device/update") {
            Route::UpdateMetadata
        } else if topic.contains("/cmd/") {
            Route::Command
        } else {
            Route::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Discarded,
    /// A reboot was requested; the caller should stop processing
    Rebooting,
}

/// The dispatcher's way back to the platform.
pub trait Uplink {
    async fn publish_info(&mut self, payload: &Value) -> Result<(), SessionError>;

    fn set_publish_interval(&mut self, interval: Duration);
}

/// Hooks for the application running on the device.
pub trait DeviceApp {
    /// Contents of the `d` object of the next telemetry publish
    fn collect_status(&mut self) -> Map<String, Value>;

    /// Called for every `cmd/` message after the built-in commands ran
    async fn handle_command<U: Uplink>(&mut self, command: &InboundCommand, uplink: &mut U);

    /// Called after the platform replaced the device metadata
    fn metadata_updated(&mut self, meta: &Map<String, Value>);
}

/// Mutable state a dispatch may touch, borrowed from the agent for one message.
pub struct DispatchContext<'a, U, A> {
    pub config: &'a mut DeviceConfig,
    pub uplink: &'a mut U,
    pub app: &'a mut A,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UpgradeTarget {
    server: String,
    port: u16,
    uri: String,
}

impl UpgradeTarget {
    fn from_value(value: &Value) -> Option<Self> {
        let upgrade = value.as_object()?;
        let server = upgrade.get("server")?.as_str()?.trim();
        let port = match upgrade.get("port")? {
            Value::String(text) => text.trim().parse::<u16>().ok()?,
            Value::Number(number) => u16::try_from(number.as_u64()?).ok()?,
            _ => return None,
        };
        let uri = upgrade.get("uri")?.as_str()?;

        if server.is_empty() || port == 0 {
            return None;
        }
        Some(Self {
            server: server.to_string(),
            port,
            uri: uri.to_string(),
        })
    }
}

pub struct CommandDispatcher<N, F> {
    store: ConfigStore,
    power: Arc<dyn PowerControl>,
    resolver: N,
    updater: F,
}

impl<N: Resolver, F: FirmwareUpdater> CommandDispatcher<N, F> {
    pub fn new(store: ConfigStore, power: Arc<dyn PowerControl>, resolver: N, updater: F) -> Self {
        Self {
            store,
            power,
            resolver,
            updater,
        }
    }

    pub async fn dispatch<U: Uplink, A: DeviceApp>(
        &mut self,
        raw: &RawMessage,
        ctx: DispatchContext<'_, U, A>,
    ) -> Dispatch {
        let command = match InboundCommand::parse(raw) {
            Ok(command) => command,
            Err(e) => {
                warn!("Discarding message: {}", e);
                return Dispatch::Discarded;
            }
        };
        debug!("Inbound {}", command);

        match Route::classify(&command.topic) {
            Route::Response => Dispatch::Handled,
            Route::Reboot => {
                info!("Reboot requested by platform");
                self.power.hard_reboot();
                Dispatch::Rebooting
            }
            Route::FactoryReset => {
                info!("Factory reset requested by platform");
                match self.store.reset().await {
                    Ok(fresh) => *ctx.config = fresh,
                    Err(e) => error!("Factory reset could not persist: {}", e),
                }
                self.power.hard_reboot();
                Dispatch::Rebooting
            }
            Route::UpdateMetadata => {
                self.update_metadata(&command, ctx).await;
                Dispatch::Handled
            }
            Route::Command => self.run_command(&command, ctx).await,
            Route::Unknown => {
                debug!("No route for {}", command.topic);
                Dispatch::Discarded
            }
        }
    }

    async fn update_metadata<U: Uplink, A: DeviceApp>(
        &mut self,
        command: &InboundCommand,
        ctx: DispatchContext<'_, U, A>,
    ) {
        let fields = command
            .d()
            .and_then(|d| d.get("fields"))
            .and_then(Value::as_array);

        for field in fields.into_iter().flatten() {
            let is_metadata = field
                .get("field")
                .and_then(Value::as_str)
                .is_some_and(|name| name.contains("metadata"));
            if !is_metadata {
                continue;
            }

            ctx.config.meta = field
                .get("value")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            info!(
                "Metadata replaced: {}",
                serde_json::Value::Object(ctx.config.meta.clone())
            );
            if let Err(e) = self.store.save(ctx.config).await {
                error!("Unable to persist metadata: {}", e);
            }
        }

        ctx.uplink
            .set_publish_interval(ctx.config.publish_interval());
        ctx.app.metadata_updated(&ctx.config.meta);
    }

    async fn run_command<U: Uplink, A: DeviceApp>(
        &mut self,
        command: &InboundCommand,
        ctx: DispatchContext<'_, U, A>,
    ) -> Dispatch {
        if let Some(d) = command.d() {
            if let Some(upgrade) = d.get("upgrade") {
                self.upgrade(upgrade, ctx.uplink).await;
            } else if d.contains_key("config") {
                let snapshot =
                    ConfigStore::masked(ctx.config).with_field("compile_date", COMPILE_DATE);
                publish(ctx.uplink, &message_manager::config_snapshot(snapshot)).await;
            }
        }

        ctx.app.handle_command(command, ctx.uplink).await;
        Dispatch::Handled
    }

    async fn upgrade<U: Uplink>(&mut self, upgrade: &Value, uplink: &mut U) {
        let Some(target) = UpgradeTarget::from_value(upgrade) else {
            warn!("Upgrade request is missing server, port or uri");
            publish(uplink, &message_manager::ota_status(OTA_INFO_ERROR)).await;
            return;
        };

        let ip = match self.resolver.resolve(&target.server).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("{}", e);
                let status = failed_status(&format!(
                    "{}:{}{}",
                    target.server, target.port, target.uri
                ));
                publish(uplink, &message_manager::ota_status(&status)).await;
                return;
            }
        };
        let authority = SocketAddr::new(ip, target.port);
        let url = format!("http://{}{}", authority, target.uri);

        info!("Firmware upgrade from {}", url);
        publish(uplink, &message_manager::upgrade_starting()).await;

        match self.updater.apply(&url).await {
            UpdateOutcome::Failed => {
                let status = failed_status(&format!("{}{}", authority, target.uri));
                publish(uplink, &message_manager::ota_status(&status)).await;
            }
            UpdateOutcome::NoUpdateAvailable => {
                publish(uplink, &message_manager::ota_status(OTA_NO_UPDATE)).await;
            }
            UpdateOutcome::Applied => info!("[update] Update ok."),
        }
    }
}

fn failed_status(location: &str) -> String {
    format!("[update] Update failed. http://{location}")
}

async fn publish<U: Uplink>(uplink: &mut U, payload: &Value) {
    if let Err(e) = uplink.publish_info(payload).await {
        warn!("Unable to publish info: {}", e);
    }
}
