/*
 * Hearthd - self-hosted cloud services for liberated smart thermostats
 * Copyright (c) 2024-2026  Hearthd contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

pub mod derived;
pub mod discovery;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::integrations::Integration;
use crate::object::{device_key, epoch_ms, object_type, shared_key, Serial, UserId};
use crate::state_service::{DeviceStateChange, DeviceStateService};
use crate::users::{IntegrationRecord, UserStore};
use crate::weather::{WeatherService, DEFAULT_COUNTRY};

use derived::WriteTarget;
use discovery::ClimateCapabilities;

pub const DEFAULT_TOPIC_PREFIX: &str = "nest";
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
const REQUEST_CHANNEL_CAPACITY: usize = 64;
const KEEP_ALIVE_SECS: u64 = 30;

/// Per-user bridge configuration, stored as JSON in the integrations table.
/// Field aliases accept the camelCase spelling the frontend console stores.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttBridgeConfig {
    #[serde(default, alias = "brokerUrl")]
    pub broker_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, alias = "clientId")]
    pub client_id: Option<String>,
    #[serde(default = "default_topic_prefix", alias = "topicPrefix")]
    pub topic_prefix: String,
    #[serde(default = "default_discovery_prefix", alias = "discoveryPrefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_true", alias = "publishRaw")]
    pub publish_raw: bool,
    #[serde(default = "default_true", alias = "homeAssistantDiscovery")]
    pub home_assistant_discovery: bool,
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_discovery_prefix() -> String {
    DEFAULT_DISCOVERY_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}

/// Mirrors one user's thermostats onto an MQTT broker and ingests commands
/// from it.
///
/// State flows out as raw object topics, a derived climate view and
/// discovery configs; `…/set` topics flow back in through the device state
/// service so the devices and all other subscribers see hub-initiated
/// changes exactly like device-initiated ones.
pub struct MqttBridge {
    ctx: Arc<BridgeCtx>,
    eventloop: std::sync::Mutex<Option<EventLoop>>,
    cancel: CancellationToken,
}

struct BridgeCtx {
    user_id: UserId,
    config: MqttBridgeConfig,
    client: AsyncClient,
    state: Arc<DeviceStateService>,
    users: Arc<UserStore>,
    weather: Arc<WeatherService>,
    settings: Arc<Settings>,
    devices: tokio::sync::RwLock<BTreeSet<Serial>>,
}

impl MqttBridge {
    pub fn from_record(
        record: &IntegrationRecord,
        state: Arc<DeviceStateService>,
        users: Arc<UserStore>,
        weather: Arc<WeatherService>,
        settings: Arc<Settings>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let config: MqttBridgeConfig = serde_json::from_str(&record.config_json)
            .context("Parsing MQTT bridge configuration")?;
        let broker_url = config
            .broker_url
            .clone()
            .or_else(|| settings.default_broker_url.clone())
            .ok_or_else(|| anyhow!("No MQTT broker configured"))?;
        let (host, port) = parse_broker_url(&broker_url)?;

        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("hearthd-{}", record.user_id));
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(std::time::Duration::from_secs(KEEP_ALIVE_SECS));
        options.set_last_will(LastWill::new(
            format!("{}/status", config.topic_prefix),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));
        if let Some(username) = &config.username {
            options.set_credentials(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            );
        }
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        Ok(Arc::new(Self {
            ctx: Arc::new(BridgeCtx {
                user_id: record.user_id.clone(),
                config,
                client,
                state,
                users,
                weather,
                settings,
                devices: tokio::sync::RwLock::new(BTreeSet::new()),
            }),
            eventloop: std::sync::Mutex::new(Some(eventloop)),
            cancel,
        }))
    }
}

#[async_trait]
impl Integration for MqttBridge {
    fn integration_type(&self) -> &'static str {
        "mqtt"
    }

    fn user_id(&self) -> &str {
        &self.ctx.user_id
    }

    async fn initialize(&self) -> Result<()> {
        let eventloop = self
            .eventloop
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| anyhow!("Bridge already initialized"))?;

        let (connected_tx, connected_rx) = oneshot::channel();
        tokio::spawn(event_loop_task(
            Arc::clone(&self.ctx),
            eventloop,
            connected_tx,
            self.cancel.clone(),
        ));

        tokio::time::timeout(self.ctx.settings.mqtt_connect_timeout, connected_rx)
            .await
            .map_err(|_| anyhow!("Timed out connecting to the MQTT broker"))?
            .map_err(|_| anyhow!("MQTT event loop ended before connecting"))?;

        self.ctx.reconcile_devices().await?;
        tokio::spawn(reconcile_task(Arc::clone(&self.ctx), self.cancel.clone()));
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        // the goodbye messages still need the event loop, so publish and
        // disconnect before cancelling the tasks
        let ctx = &self.ctx;
        let devices = ctx.devices.read().await.clone();
        for serial in &devices {
            ctx.publish_availability(serial, false).await;
        }
        ctx.publish_retained(&format!("{}/status", ctx.config.topic_prefix), "offline")
            .await;
        ctx.client
            .disconnect()
            .await
            .context("Disconnecting from the MQTT broker")?;
        self.cancel.cancel();
        Ok(())
    }

    async fn on_device_state_change(&self, change: &DeviceStateChange) -> Result<()> {
        let ctx = &self.ctx;
        if !ctx.devices.read().await.contains(&change.serial) {
            return Ok(());
        }
        let object_type = object_type(&change.object_key);
        if ctx.config.publish_raw {
            ctx.publish_raw_object(&change.serial, object_type, &change.value)
                .await;
        }
        if object_type == "device" || object_type == "shared" {
            ctx.publish_derived(&change.serial).await?;
            // a mode change reshapes the hub entity schema
            if ctx.config.home_assistant_discovery
                && change.value.get("target_temperature_type").is_some()
            {
                ctx.publish_discovery(&change.serial).await?;
            }
        }
        Ok(())
    }

    async fn on_device_connected(&self, serial: &str) -> Result<()> {
        if self.ctx.devices.read().await.contains(serial) {
            self.ctx.publish_availability(serial, true).await;
        }
        Ok(())
    }

    async fn on_device_disconnected(&self, serial: &str) -> Result<()> {
        if self.ctx.devices.read().await.contains(serial) {
            self.ctx.publish_availability(serial, false).await;
        }
        Ok(())
    }
}

async fn event_loop_task(
    ctx: Arc<BridgeCtx>,
    mut eventloop: EventLoop,
    connected_tx: oneshot::Sender<()>,
    cancel: CancellationToken,
) {
    let mut connected_tx = Some(connected_tx);
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected for user {}", ctx.user_id);
                ctx.on_connected().await;
                if let Some(tx) = connected_tx.take() {
                    let _ = tx.send(());
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).to_string();
                if let Err(err) = ctx.handle_incoming(&publish.topic, &payload).await {
                    warn!(
                        "MQTT command on {} for user {} ignored: {err:#}",
                        publish.topic, ctx.user_id
                    );
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!("MQTT connection error for user {}: {err}", ctx.user_id);
                tokio::time::sleep(ctx.settings.mqtt_reconnect_period).await;
            }
        }
    }
    debug!("MQTT event loop stopped for user {}", ctx.user_id);
}

async fn reconcile_task(ctx: Arc<BridgeCtx>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.settings.device_list_reconcile_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the initial reconcile already ran
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = ctx.reconcile_devices().await {
                    warn!("Device list reconciliation for user {}: {err:#}", ctx.user_id);
                }
            }
        }
    }
}

impl BridgeCtx {
    /// Subscribes to the command topics and announces the bridge. Runs on
    /// every (re)connect since the broker forgets subscriptions.
    async fn on_connected(&self) {
        let prefix = &self.config.topic_prefix;
        // one filter covers both raw («t»/«field»/set) and ha command topics
        let filter = format!("{prefix}/+/+/+/set");
        if let Err(err) = self.client.subscribe(&filter, QoS::AtMostOnce).await {
            warn!("MQTT subscribe to {filter} failed: {err}");
        }
        self.publish_retained(&format!("{prefix}/status"), "online")
            .await;
        let devices = self.devices.read().await.clone();
        for serial in &devices {
            self.publish_availability(serial, self.state.availability(serial))
                .await;
        }
    }

    /// Aligns the published device set with the user's owned and shared
    /// serials. New devices get discovery plus a full state snapshot;
    /// removed ones get tombstones and go offline.
    async fn reconcile_devices(&self) -> Result<()> {
        let desired = self.users.device_set(&self.user_id).await?;
        let current = self.devices.read().await.clone();
        if desired == current {
            return Ok(());
        }

        for serial in desired.difference(&current) {
            info!("MQTT bridge for user {} picked up device {serial}", self.user_id);
            if self.config.home_assistant_discovery {
                self.publish_discovery(serial).await?;
            }
            if self.config.publish_raw {
                let objects = self.state.get_all_for_device(serial).await?;
                for object in objects.values() {
                    self.publish_raw_object(serial, object.object_type(), &object.value)
                        .await;
                }
            }
            self.publish_derived(serial).await?;
            self.publish_availability(serial, self.state.availability(serial))
                .await;
        }
        for serial in current.difference(&desired) {
            info!("MQTT bridge for user {} dropped device {serial}", self.user_id);
            self.publish_discovery_tombstones(serial).await;
            self.publish_availability(serial, false).await;
        }

        *self.devices.write().await = desired;
        Ok(())
    }

    /// Full object to `«prefix»/«serial»/«type»` plus one topic per
    /// top-level field.
    async fn publish_raw_object(&self, serial: &str, object_type: &str, value: &Value) {
        let prefix = &self.config.topic_prefix;
        self.publish_retained(&format!("{prefix}/{serial}/{object_type}"), value.to_string())
            .await;
        if let Some(fields) = value.as_object() {
            for (field, field_value) in fields {
                self.publish_retained(
                    &format!("{prefix}/{serial}/{object_type}/{field}"),
                    scalar_payload(field_value),
                )
                .await;
            }
        }
    }

    async fn publish_derived(&self, serial: &str) -> Result<()> {
        let objects = self.state.get_all_for_device(serial).await?;
        let device = objects.get(&device_key(serial)).map(|o| &o.value);
        let shared = objects.get(&shared_key(serial)).map(|o| &o.value);
        let outdoor = self.outdoor_temperature(device).await;
        let state = derived::derive_state(device, shared, outdoor, epoch_ms() / 1000);
        let prefix = &self.config.topic_prefix;
        for (suffix, payload) in derived::state_payloads(&state) {
            self.publish_retained(&format!("{prefix}/{serial}/{suffix}"), payload)
                .await;
        }
        Ok(())
    }

    async fn publish_discovery(&self, serial: &str) -> Result<()> {
        let shared = self
            .state
            .get(serial, &shared_key(serial))
            .await?
            .map(|o| o.value);
        let caps = ClimateCapabilities::from_shared(shared.as_ref());
        let prefix = &self.config.topic_prefix;
        let discovery_prefix = &self.config.discovery_prefix;
        let (topic, payload) = discovery::climate_config(prefix, discovery_prefix, serial, caps);
        self.publish_retained(&topic, payload.to_string()).await;
        for (topic, payload) in discovery::sensor_configs(prefix, discovery_prefix, serial) {
            self.publish_retained(&topic, payload.to_string()).await;
        }
        Ok(())
    }

    async fn publish_discovery_tombstones(&self, serial: &str) {
        for topic in
            discovery::discovery_topics(&self.config.topic_prefix, &self.config.discovery_prefix, serial)
        {
            self.publish_retained(&topic, "").await;
        }
    }

    async fn publish_availability(&self, serial: &str, available: bool) {
        let payload = if available { "online" } else { "offline" };
        self.publish_retained(
            &format!("{}/{serial}/availability", self.config.topic_prefix),
            payload,
        )
        .await;
    }

    /// Non-blocking publish: this runs inside the device write path's
    /// observer fan-out, so a stalled broker connection drops the message
    /// instead of holding up the write.
    async fn publish_retained(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        if let Err(err) = self.client.try_publish(topic, QoS::AtMostOnce, true, payload) {
            warn!("MQTT publish to {topic} failed: {err}");
        }
    }

    /// One command message from the broker. Unknown serials and malformed
    /// payloads are ignored; valid commands write through the device state
    /// service, which re-publishes the resulting state.
    async fn handle_incoming(&self, topic: &str, payload: &str) -> Result<()> {
        let Some((serial, object_type, field)) =
            parse_command_topic(&self.config.topic_prefix, topic)
        else {
            trace!("Not a command topic: {topic}");
            return Ok(());
        };
        if !self.users.user_has_serial(&self.user_id, serial).await? {
            return Err(anyhow!("Serial {serial} is not in the user's device set"));
        }

        let (key, value) = if object_type == "ha" {
            let shared = self
                .state
                .get(serial, &shared_key(serial))
                .await?
                .map(|o| o.value);
            let write =
                derived::translate_command(field, payload, shared.as_ref(), epoch_ms() / 1000)?;
            let key = match write.target {
                WriteTarget::Device => device_key(serial),
                WriteTarget::Shared => shared_key(serial),
            };
            (key, write.value)
        } else {
            let field_value: Value = serde_json::from_str(payload)
                .unwrap_or_else(|_| Value::String(payload.to_string()));
            let mut value = serde_json::Map::new();
            value.insert(field.to_string(), field_value);
            (format!("{object_type}.{serial}"), Value::Object(value))
        };

        let next_revision = self
            .state
            .get(serial, &key)
            .await?
            .map_or(1, |existing| existing.object_revision + 1);
        debug!(
            "MQTT command {topic} for user {} writes ({serial}, {key})",
            self.user_id
        );
        self.state
            .upsert(serial, &key, next_revision, epoch_ms(), value)
            .await?;
        Ok(())
    }

    async fn outdoor_temperature(&self, device: Option<&Value>) -> Option<f64> {
        let device = device?;
        let postal_code = device.get("postal_code")?.as_str()?;
        if postal_code.is_empty() {
            return None;
        }
        let country = device
            .get("country")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_COUNTRY);
        let report = self.weather.get(postal_code, country).await?;
        report
            .current
            .get("temp_c")
            .and_then(Value::as_f64)
    }
}

/// Accepts `mqtt://host[:port]`, `tcp://host[:port]` or a bare `host[:port]`.
fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);
    if stripped.is_empty() || stripped.contains('/') {
        return Err(anyhow!("Unsupported broker URL: {url}"));
    }
    match stripped.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow!("Invalid broker port in {url}"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((stripped.to_string(), 1883)),
    }
}

/// `«prefix»/«serial»/«type»/«field»/set` → `(serial, type, field)`.
fn parse_command_topic<'t>(prefix: &str, topic: &'t str) -> Option<(&'t str, &'t str, &'t str)> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        [p, serial, object_type, field, "set"] if *p == prefix => {
            Some((serial, object_type, field))
        }
        _ => None,
    }
}

fn scalar_payload(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::Db;
    use crate::store::ObjectStore;
    use crate::subscriptions::SubscriptionManager;
    use crate::users::test_support::add_owner;
    use crate::users::AuthPolicy;
    use crate::watchdog::{AvailabilityWatchdog, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT};
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn broker_urls_parse() {
        assert_eq!(
            parse_broker_url("mqtt://broker.local:1884").unwrap(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(
            parse_broker_url("tcp://10.0.0.2").unwrap(),
            ("10.0.0.2".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("localhost").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert!(parse_broker_url("mqtt://").is_err());
        assert!(parse_broker_url("mqtt://host/path").is_err());
        assert!(parse_broker_url("mqtt://host:port").is_err());
    }

    #[test]
    fn command_topics_parse() {
        assert_eq!(
            parse_command_topic("nest", "nest/C/ha/mode/set"),
            Some(("C", "ha", "mode"))
        );
        assert_eq!(
            parse_command_topic("nest", "nest/C/device/fan_mode/set"),
            Some(("C", "device", "fan_mode"))
        );
        assert_eq!(parse_command_topic("nest", "nest/C/ha/mode"), None);
        assert_eq!(parse_command_topic("nest", "other/C/ha/mode/set"), None);
        assert_eq!(parse_command_topic("nest", "nest/status"), None);
    }

    #[test]
    fn config_defaults_fill_in() {
        let config: MqttBridgeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.topic_prefix, "nest");
        assert_eq!(config.discovery_prefix, "homeassistant");
        assert!(config.publish_raw);
        assert!(config.home_assistant_discovery);
        assert!(config.broker_url.is_none());

        let config: MqttBridgeConfig = serde_json::from_str(
            r#"{"broker_url": "mqtt://b:1883", "topic_prefix": "n", "homeAssistantDiscovery": false}"#,
        )
        .unwrap();
        assert_eq!(config.topic_prefix, "n");
        assert!(!config.home_assistant_discovery);
    }

    #[test]
    fn scalar_payloads_render_bare_strings() {
        assert_eq!(scalar_payload(&json!("heat")), "heat");
        assert_eq!(scalar_payload(&json!(21.5)), "21.5");
        assert_eq!(scalar_payload(&json!(true)), "true");
        assert_eq!(scalar_payload(&json!({"a": 1})), "{\"a\":1}");
    }

    fn test_settings() -> Settings {
        Settings {
            db_path: PathBuf::from(":memory:"),
            address: None,
            port: 3000,
            transport_url: None,
            weather_url: None,
            auth_policy: AuthPolicy::Open,
            availability_timeout: DEFAULT_TIMEOUT,
            availability_check_interval: DEFAULT_CHECK_INTERVAL,
            long_poll_timeout: Duration::from_secs(60),
            default_broker_url: Some("mqtt://localhost:1883".to_string()),
            mqtt_connect_timeout: Duration::from_secs(10),
            mqtt_reconnect_period: Duration::from_secs(5),
            device_list_reconcile_interval: Duration::from_secs(10),
            weather_cache_ttl: Duration::from_secs(1800),
        }
    }

    async fn test_ctx() -> Arc<BridgeCtx> {
        let db = Arc::new(Db::open_in_memory().unwrap());
        add_owner(&db, "U", "C").await;
        let state = Arc::new(DeviceStateService::new(
            Arc::new(ObjectStore::new(Arc::clone(&db))),
            Arc::new(AvailabilityWatchdog::new(
                DEFAULT_TIMEOUT,
                DEFAULT_CHECK_INTERVAL,
            )),
            Arc::new(SubscriptionManager::new()),
        ));
        let record = IntegrationRecord {
            user_id: "U".to_string(),
            integration_type: "mqtt".to_string(),
            enabled: true,
            config_json: "{}".to_string(),
        };
        let bridge = MqttBridge::from_record(
            &record,
            state,
            Arc::new(UserStore::new(Arc::clone(&db))),
            Arc::new(WeatherService::new(db, Duration::from_secs(1800))),
            Arc::new(test_settings()),
            CancellationToken::new(),
        )
        .unwrap();
        Arc::clone(&bridge.ctx)
    }

    #[tokio::test]
    async fn ha_mode_command_writes_the_shared_object() {
        let ctx = test_ctx().await;
        ctx.handle_incoming("nest/C/ha/mode/set", "heat")
            .await
            .unwrap();
        let shared = ctx.state.get("C", "shared.C").await.unwrap().unwrap();
        assert_eq!(shared.value["target_temperature_type"], json!("heat"));
        assert_eq!(shared.object_revision, 1);

        // a second command bumps the revision
        ctx.handle_incoming("nest/C/ha/mode/set", "cool")
            .await
            .unwrap();
        let shared = ctx.state.get("C", "shared.C").await.unwrap().unwrap();
        assert_eq!(shared.value["target_temperature_type"], json!("cool"));
        assert_eq!(shared.object_revision, 2);
    }

    #[tokio::test]
    async fn raw_command_sets_a_single_field() {
        let ctx = test_ctx().await;
        ctx.handle_incoming("nest/C/shared/target_temperature/set", "21.5")
            .await
            .unwrap();
        let shared = ctx.state.get("C", "shared.C").await.unwrap().unwrap();
        assert_eq!(shared.value, json!({"target_temperature": 21.5}));

        // non-JSON payloads fall back to strings
        ctx.handle_incoming("nest/C/device/fan_mode/set", "duty-cycle")
            .await
            .unwrap();
        let device = ctx.state.get("C", "device.C").await.unwrap().unwrap();
        assert_eq!(device.value["fan_mode"], json!("duty-cycle"));
    }

    #[tokio::test]
    async fn fan_command_writes_the_timer_fields_through() {
        let ctx = test_ctx().await;
        ctx.handle_incoming("nest/C/ha/fan_mode/set", "on")
            .await
            .unwrap();
        let device = ctx.state.get("C", "device.C").await.unwrap().unwrap();
        assert_eq!(device.value["fan_control_state"], json!(true));
        assert_eq!(device.value["fan_timer_active"], json!(true));
        assert!(device.value["fan_timer_timeout"].as_i64().unwrap() > epoch_ms() / 1000);
    }

    #[tokio::test]
    async fn commands_for_foreign_serials_are_rejected() {
        let ctx = test_ctx().await;
        let err = ctx
            .handle_incoming("nest/STOLEN/ha/mode/set", "heat")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("device set"));
        assert!(ctx.state.get("STOLEN", "shared.STOLEN").await.unwrap().is_none());

        // invalid payloads are errors too, with no write
        assert!(ctx
            .handle_incoming("nest/C/ha/mode/set", "tropical")
            .await
            .is_err());
        assert!(ctx.state.get("C", "shared.C").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_command_topics_are_ignored() {
        let ctx = test_ctx().await;
        ctx.handle_incoming("nest/C/ha/mode", "heat").await.unwrap();
        ctx.handle_incoming("nest/status", "online").await.unwrap();
        assert!(ctx.state.get("C", "shared.C").await.unwrap().is_none());
    }
}
