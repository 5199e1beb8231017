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

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{error, trace};
use serde_json::Value;

use crate::object::{DeviceObject, EpochMillis, ObjectKey, Revision, Serial};
use crate::store::ObjectStore;
use crate::subscriptions::SubscriptionManager;
use crate::watchdog::AvailabilityWatchdog;

/// One applied mutation, as handed to observers after the store commit.
#[derive(Debug, Clone)]
pub struct DeviceStateChange {
    pub serial: Serial,
    pub object_key: ObjectKey,
    pub value: Value,
    pub revision: Revision,
    pub timestamp: EpochMillis,
}

/// Downstream consumers of state and availability changes, applied in
/// registration order after the watchdog and subscription manager.
/// Observer errors are logged and never surface to the write path.
#[async_trait]
pub trait StateObserver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_state_change(&self, change: &DeviceStateChange) -> Result<()>;

    async fn on_availability_change(&self, serial: &str, available: bool) -> Result<()>;
}

/// Façade over the object store, watchdog and subscription manager.
///
/// Every mutating path in the daemon goes through `upsert` so that the
/// liveness tracker, open long polls and outbound integrations observe each
/// write exactly once and in a fixed order.
pub struct DeviceStateService {
    store: Arc<ObjectStore>,
    watchdog: Arc<AvailabilityWatchdog>,
    subscriptions: Arc<SubscriptionManager>,
    observers: std::sync::RwLock<Vec<Arc<dyn StateObserver>>>,
}

impl DeviceStateService {
    pub fn new(
        store: Arc<ObjectStore>,
        watchdog: Arc<AvailabilityWatchdog>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Self {
        Self {
            store,
            watchdog,
            subscriptions,
            observers: std::sync::RwLock::new(Vec::new()),
        }
    }

    pub fn register_observer(&self, observer: Arc<dyn StateObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(observer);
    }

    pub async fn get(&self, serial: &str, key: &str) -> Result<Option<DeviceObject>> {
        self.store.get(serial, key).await
    }

    pub async fn get_all_for_device(
        &self,
        serial: &str,
    ) -> Result<HashMap<ObjectKey, DeviceObject>> {
        self.store.get_all_for_device(serial).await
    }

    pub async fn device_serials(&self) -> Result<Vec<Serial>> {
        self.store.device_serials().await
    }

    pub fn mark_seen(&self, serial: &str) {
        self.watchdog.mark_seen(serial);
    }

    pub fn availability(&self, serial: &str) -> bool {
        self.watchdog.get_availability(serial)
    }

    /// Applies one write and fans it out: store commit, then watchdog
    /// mark-seen, then long-poll delivery, then the registered observers.
    pub async fn upsert(
        &self,
        serial: &str,
        key: &str,
        revision: Revision,
        timestamp: EpochMillis,
        value: Value,
    ) -> Result<DeviceObject> {
        let updated = self
            .store
            .upsert(serial, key, revision, timestamp, value)
            .await?;

        self.watchdog.mark_seen(serial);
        let notified = self.subscriptions.notify(serial, key, &updated);
        trace!("Write ({serial}, {key}) rev {} woke {notified} waiter(s)", updated.object_revision);

        let change = DeviceStateChange {
            serial: updated.serial.clone(),
            object_key: updated.object_key.clone(),
            value: updated.value.clone(),
            revision: updated.object_revision,
            timestamp: updated.object_timestamp,
        };
        self.dispatch_state_change(&change).await;
        Ok(updated)
    }

    async fn dispatch_state_change(&self, change: &DeviceStateChange) {
        for observer in self.observer_snapshot() {
            if let Err(err) = observer.on_state_change(change).await {
                error!(
                    "Observer {} failed on ({}, {}): {err:#}",
                    observer.name(),
                    change.serial,
                    change.object_key
                );
            }
        }
    }

    /// Fans an availability transition out to all observers. Wired to the
    /// watchdog's change handler at startup.
    pub async fn dispatch_availability_change(&self, serial: &str, available: bool) {
        for observer in self.observer_snapshot() {
            if let Err(err) = observer.on_availability_change(serial, available).await {
                error!(
                    "Observer {} failed on availability of {serial}: {err:#}",
                    observer.name()
                );
            }
        }
    }

    fn observer_snapshot(&self) -> Vec<Arc<dyn StateObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::Db;
    use crate::watchdog::{DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT};
    use anyhow::anyhow;
    use serde_json::json;
    use std::time::Duration;

    struct RecordingObserver {
        label: &'static str,
        log: Arc<std::sync::Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl StateObserver for RecordingObserver {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn on_state_change(&self, change: &DeviceStateChange) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.label, change.object_key));
            if self.fail {
                return Err(anyhow!("observer down"));
            }
            Ok(())
        }

        async fn on_availability_change(&self, serial: &str, available: bool) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{serial}={available}", self.label));
            Ok(())
        }
    }

    fn service() -> (Arc<DeviceStateService>, Arc<SubscriptionManager>) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let subscriptions = Arc::new(SubscriptionManager::new());
        let service = Arc::new(DeviceStateService::new(
            Arc::new(ObjectStore::new(db)),
            Arc::new(AvailabilityWatchdog::new(
                DEFAULT_TIMEOUT,
                DEFAULT_CHECK_INTERVAL,
            )),
            Arc::clone(&subscriptions),
        ));
        (service, subscriptions)
    }

    #[tokio::test]
    async fn upsert_marks_seen_notifies_and_dispatches() {
        let (service, subscriptions) = service();
        let log: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        service.register_observer(Arc::new(RecordingObserver {
            label: "first",
            log: Arc::clone(&log),
            fail: true,
        }));
        service.register_observer(Arc::new(RecordingObserver {
            label: "second",
            log: Arc::clone(&log),
            fail: false,
        }));

        let waiter = Arc::clone(&subscriptions).register("A", "subscribe", None);
        let updated = service
            .upsert("A", "shared.A", 5, 2000, json!({"target_temperature": 22.5}))
            .await
            .unwrap();
        assert_eq!(updated.object_revision, 5);

        // the waiter was satisfied before observers could fail anything
        let delivered = waiter.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(delivered.value["target_temperature"], json!(22.5));
        assert!(service.availability("A"));

        // both observers ran, in registration order, despite the first failing
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["first:shared.A".to_string(), "second:shared.A".to_string()]
        );
    }

    #[tokio::test]
    async fn availability_changes_reach_observers() {
        let (service, _) = service();
        let log: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        service.register_observer(Arc::new(RecordingObserver {
            label: "bus",
            log: Arc::clone(&log),
            fail: false,
        }));
        service.dispatch_availability_change("A", true).await;
        service.dispatch_availability_change("A", false).await;
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["bus:A=true".to_string(), "bus:A=false".to_string()]
        );
    }
}
