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

pub mod mqtt;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{error, info, warn};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::object::UserId;
use crate::state_service::{DeviceStateChange, DeviceStateService, StateObserver};
use crate::users::{IntegrationRecord, UserStore};
use crate::weather::WeatherService;

/// One outbound integration instance, scoped to a single user. Instances own
/// their external connection and receive every mutation and availability
/// transition for the user's device set.
#[async_trait]
pub trait Integration: Send + Sync {
    fn integration_type(&self) -> &'static str;

    fn user_id(&self) -> &str;

    async fn initialize(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    async fn on_device_state_change(&self, change: &DeviceStateChange) -> Result<()>;

    async fn on_device_connected(&self, serial: &str) -> Result<()>;

    async fn on_device_disconnected(&self, serial: &str) -> Result<()>;
}

/// Owns the running integration instances, one per user at most.
///
/// Start and stop for a given user are serialized through a per-user lock so
/// a reconfigured instance can never run twice concurrently. A user whose
/// integration fails to start is recorded and left disabled; other users are
/// unaffected.
pub struct IntegrationManager {
    state: Arc<DeviceStateService>,
    users: Arc<UserStore>,
    weather: Arc<WeatherService>,
    settings: Arc<Settings>,
    instances: tokio::sync::RwLock<HashMap<UserId, Arc<dyn Integration>>>,
    startup_errors: std::sync::Mutex<HashMap<UserId, String>>,
    user_locks: std::sync::Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
    cancel: CancellationToken,
}

impl IntegrationManager {
    pub fn new(
        state: Arc<DeviceStateService>,
        users: Arc<UserStore>,
        weather: Arc<WeatherService>,
        settings: Arc<Settings>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            users,
            weather,
            settings,
            instances: tokio::sync::RwLock::new(HashMap::new()),
            startup_errors: std::sync::Mutex::new(HashMap::new()),
            user_locks: std::sync::Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Starts every enabled integration found in the backing table.
    pub async fn start_all(&self) {
        let records = match self.users.integration_configs().await {
            Ok(records) => records,
            Err(err) => {
                error!("Could not load integration configurations: {err:#}");
                return;
            }
        };
        for record in records {
            if !record.enabled {
                continue;
            }
            self.start_user(record).await;
        }
    }

    /// (Re)starts the integration for one user: any running instance is shut
    /// down first, then the new one is brought up. Startup failures disable
    /// the user's integration until reconfigured.
    pub async fn start_user(&self, record: IntegrationRecord) {
        let user_id = record.user_id.clone();
        let user_lock = self.user_lock(&user_id);
        let _guard = user_lock.lock().await;

        self.stop_instance(&user_id).await;

        let instance = match self.build_instance(&record) {
            Ok(instance) => instance,
            Err(err) => {
                warn!("Integration config for user {user_id} is invalid: {err:#}");
                self.record_startup_error(&user_id, &err);
                return;
            }
        };
        match instance.initialize().await {
            Ok(()) => {
                info!(
                    "Integration {} started for user {user_id}",
                    instance.integration_type()
                );
                self.startup_errors
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&user_id);
                self.instances
                    .write()
                    .await
                    .insert(user_id, instance);
            }
            Err(err) => {
                error!("Integration startup failed for user {user_id}: {err:#}");
                self.record_startup_error(&user_id, &err);
                // make sure a half-started instance does not linger
                if let Err(err) = instance.shutdown().await {
                    warn!("Cleanup after failed startup for user {user_id}: {err:#}");
                }
            }
        }
    }

    pub async fn stop_user(&self, user_id: &str) {
        let user_lock = self.user_lock(user_id);
        let _guard = user_lock.lock().await;
        self.stop_instance(user_id).await;
    }

    pub async fn shutdown_all(&self) {
        let user_ids: Vec<UserId> = self.instances.read().await.keys().cloned().collect();
        for user_id in user_ids {
            self.stop_user(&user_id).await;
        }
        self.cancel.cancel();
    }

    /// The captured startup error for a user, if its integration is down.
    pub fn startup_error(&self, user_id: &str) -> Option<String> {
        self.startup_errors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(user_id)
            .cloned()
    }

    fn build_instance(&self, record: &IntegrationRecord) -> Result<Arc<dyn Integration>> {
        match record.integration_type.as_str() {
            "mqtt" => {
                let bridge = mqtt::MqttBridge::from_record(
                    record,
                    Arc::clone(&self.state),
                    Arc::clone(&self.users),
                    Arc::clone(&self.weather),
                    Arc::clone(&self.settings),
                    self.cancel.child_token(),
                )?;
                Ok(bridge)
            }
            other => Err(anyhow!("Unknown integration type: {other}")),
        }
    }

    async fn stop_instance(&self, user_id: &str) {
        let removed = self.instances.write().await.remove(user_id);
        if let Some(instance) = removed {
            info!(
                "Stopping integration {} for user {user_id}",
                instance.integration_type()
            );
            if let Err(err) = instance.shutdown().await {
                warn!("Integration shutdown for user {user_id}: {err:#}");
            }
        }
    }

    fn record_startup_error(&self, user_id: &str, err: &anyhow::Error) {
        self.startup_errors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(user_id.to_string(), format!("{err:#}"));
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    async fn instance_snapshot(&self) -> Vec<(UserId, Arc<dyn Integration>)> {
        self.instances
            .read()
            .await
            .iter()
            .map(|(user_id, instance)| (user_id.clone(), Arc::clone(instance)))
            .collect()
    }
}

#[async_trait]
impl StateObserver for IntegrationManager {
    fn name(&self) -> &'static str {
        "integrations"
    }

    /// Routes a mutation to every integration whose user owns or is shared
    /// the serial. Per-instance failures are logged and do not stop the
    /// fan-out.
    async fn on_state_change(&self, change: &DeviceStateChange) -> Result<()> {
        for (user_id, instance) in self.instance_snapshot().await {
            match self.users.user_has_serial(&user_id, &change.serial).await {
                Ok(true) => {
                    if let Err(err) = instance.on_device_state_change(change).await {
                        warn!(
                            "Integration {} for user {user_id} rejected change on {}: {err:#}",
                            instance.integration_type(),
                            change.serial
                        );
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    warn!("Device set lookup failed for user {user_id}: {err:#}");
                }
            }
        }
        Ok(())
    }

    async fn on_availability_change(&self, serial: &str, available: bool) -> Result<()> {
        for (user_id, instance) in self.instance_snapshot().await {
            match self.users.user_has_serial(&user_id, serial).await {
                Ok(true) => {
                    let result = if available {
                        instance.on_device_connected(serial).await
                    } else {
                        instance.on_device_disconnected(serial).await
                    };
                    if let Err(err) = result {
                        warn!(
                            "Integration {} for user {user_id} rejected availability of {serial}: {err:#}",
                            instance.integration_type()
                        );
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    warn!("Device set lookup failed for user {user_id}: {err:#}");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::Db;
    use crate::store::ObjectStore;
    use crate::subscriptions::SubscriptionManager;
    use crate::users::test_support::add_owner;
    use crate::watchdog::{AvailabilityWatchdog, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT};
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;

    struct FakeIntegration {
        user: UserId,
        events: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Integration for FakeIntegration {
        fn integration_type(&self) -> &'static str {
            "fake"
        }

        fn user_id(&self) -> &str {
            &self.user
        }

        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            self.events.lock().unwrap().push("shutdown".to_string());
            Ok(())
        }

        async fn on_device_state_change(&self, change: &DeviceStateChange) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("change:{}", change.object_key));
            Ok(())
        }

        async fn on_device_connected(&self, serial: &str) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("connected:{serial}"));
            Ok(())
        }

        async fn on_device_disconnected(&self, serial: &str) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("disconnected:{serial}"));
            Ok(())
        }
    }

    fn test_settings() -> Settings {
        Settings {
            db_path: PathBuf::from(":memory:"),
            address: None,
            port: 3000,
            transport_url: None,
            weather_url: None,
            auth_policy: crate::users::AuthPolicy::Open,
            availability_timeout: DEFAULT_TIMEOUT,
            availability_check_interval: DEFAULT_CHECK_INTERVAL,
            long_poll_timeout: Duration::from_secs(60),
            default_broker_url: None,
            mqtt_connect_timeout: Duration::from_secs(10),
            mqtt_reconnect_period: Duration::from_secs(5),
            device_list_reconcile_interval: Duration::from_secs(10),
            weather_cache_ttl: Duration::from_secs(1800),
        }
    }

    async fn manager_fixture() -> (Arc<IntegrationManager>, Arc<DeviceStateService>, Arc<Db>) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        add_owner(&db, "u1", "A").await;
        add_owner(&db, "u2", "B").await;
        let service = Arc::new(DeviceStateService::new(
            Arc::new(ObjectStore::new(Arc::clone(&db))),
            Arc::new(AvailabilityWatchdog::new(
                DEFAULT_TIMEOUT,
                DEFAULT_CHECK_INTERVAL,
            )),
            Arc::new(SubscriptionManager::new()),
        ));
        let manager = Arc::new(IntegrationManager::new(
            Arc::clone(&service),
            Arc::new(UserStore::new(Arc::clone(&db))),
            Arc::new(WeatherService::new(
                Arc::clone(&db),
                Duration::from_secs(1800),
            )),
            Arc::new(test_settings()),
            CancellationToken::new(),
        ));
        service.register_observer(Arc::clone(&manager) as Arc<dyn StateObserver>);
        (manager, service, db)
    }

    #[tokio::test]
    async fn changes_route_only_to_matching_users() {
        let (manager, service, _db) = manager_fixture().await;
        let events_u1: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let events_u2: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        manager.instances.write().await.insert(
            "u1".to_string(),
            Arc::new(FakeIntegration {
                user: "u1".to_string(),
                events: Arc::clone(&events_u1),
            }),
        );
        manager.instances.write().await.insert(
            "u2".to_string(),
            Arc::new(FakeIntegration {
                user: "u2".to_string(),
                events: Arc::clone(&events_u2),
            }),
        );

        service
            .upsert("A", "shared.A", 1, 1000, json!({"target_temperature": 21.0}))
            .await
            .unwrap();
        assert_eq!(
            events_u1.lock().unwrap().as_slice(),
            &["change:shared.A".to_string()]
        );
        assert!(events_u2.lock().unwrap().is_empty());

        manager.on_availability_change("B", false).await.unwrap();
        assert_eq!(
            events_u2.lock().unwrap().as_slice(),
            &["disconnected:B".to_string()]
        );
    }

    #[tokio::test]
    async fn unknown_integration_type_is_a_startup_error() {
        let (manager, _service, _db) = manager_fixture().await;
        manager
            .start_user(IntegrationRecord {
                user_id: "u1".to_string(),
                integration_type: "webhooks".to_string(),
                enabled: true,
                config_json: "{}".to_string(),
            })
            .await;
        assert!(manager
            .startup_error("u1")
            .unwrap()
            .contains("Unknown integration type"));
        assert!(manager.instances.read().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_all_stops_instances() {
        let (manager, _service, _db) = manager_fixture().await;
        let events: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        manager.instances.write().await.insert(
            "u1".to_string(),
            Arc::new(FakeIntegration {
                user: "u1".to_string(),
                events: Arc::clone(&events),
            }),
        );
        manager.shutdown_all().await;
        assert_eq!(events.lock().unwrap().as_slice(), &["shutdown".to_string()]);
        assert!(manager.instances.read().await.is_empty());
    }
}
