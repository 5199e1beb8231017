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

pub mod db;
pub mod merge;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::warn;
use rusqlite::OptionalExtension;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::object::{epoch_ms, DeviceObject, EpochMillis, ObjectKey, Revision, Serial};
use db::Db;

/// Key-lock maps are pruned once they grow past this many idle entries.
const KEY_LOCK_PRUNE_THRESHOLD: usize = 512;

/// Persistent store of versioned device objects.
///
/// Each `(serial, object_key)` row holds the left-fold deep merge of every
/// applied write. Upserts for the same key are serialized through a per-key
/// async mutex so no two merges interleave; different keys proceed in
/// parallel, subject only to the short statement-level database lock.
pub struct ObjectStore {
    db: Arc<Db>,
    key_locks: std::sync::Mutex<HashMap<(Serial, ObjectKey), Arc<Mutex<()>>>>,
}

impl ObjectStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            key_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Reads a single object. A row whose stored JSON no longer parses is
    /// logged and treated as absent rather than failing the read path.
    pub async fn get(&self, serial: &str, key: &str) -> Result<Option<DeviceObject>> {
        let conn = self.db.conn().await;
        let row = self.retry_once(|| {
            conn.query_row(
                "SELECT object_revision, object_timestamp, value_json, updated_at \
                 FROM states WHERE serial = ?1 AND object_key = ?2",
                (serial, key),
                |row| {
                    Ok((
                        row.get::<_, Revision>(0)?,
                        row.get::<_, EpochMillis>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, EpochMillis>(3)?,
                    ))
                },
            )
            .optional()
        })?;
        let Some((revision, timestamp, value_json, updated_at)) = row else {
            return Ok(None);
        };
        match serde_json::from_str::<Value>(&value_json) {
            Ok(value) => Ok(Some(DeviceObject {
                serial: serial.to_string(),
                object_key: key.to_string(),
                object_revision: revision,
                object_timestamp: timestamp,
                value,
                updated_at,
            })),
            Err(err) => {
                warn!("Unreadable stored value for ({serial}, {key}), treating as absent: {err}");
                Ok(None)
            }
        }
    }

    /// All objects stored for a serial, keyed by object key.
    pub async fn get_all_for_device(
        &self,
        serial: &str,
    ) -> Result<HashMap<ObjectKey, DeviceObject>> {
        let conn = self.db.conn().await;
        let rows = self.retry_once(|| {
            let mut stmt = conn.prepare(
                "SELECT object_key, object_revision, object_timestamp, value_json, updated_at \
                 FROM states WHERE serial = ?1",
            )?;
            let mapped = stmt.query_map([serial], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Revision>(1)?,
                    row.get::<_, EpochMillis>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, EpochMillis>(4)?,
                ))
            })?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        let mut objects = HashMap::with_capacity(rows.len());
        for (key, revision, timestamp, value_json, updated_at) in rows {
            match serde_json::from_str::<Value>(&value_json) {
                Ok(value) => {
                    objects.insert(
                        key.clone(),
                        DeviceObject {
                            serial: serial.to_string(),
                            object_key: key,
                            object_revision: revision,
                            object_timestamp: timestamp,
                            value,
                            updated_at,
                        },
                    );
                }
                Err(err) => {
                    warn!(
                        "Unreadable stored value for ({serial}, {key}), skipping: {err}"
                    );
                }
            }
        }
        Ok(objects)
    }

    /// Every serial with at least one stored object.
    pub async fn device_serials(&self) -> Result<Vec<Serial>> {
        let conn = self.db.conn().await;
        let serials = self.retry_once(|| {
            let mut stmt = conn.prepare("SELECT DISTINCT serial FROM states ORDER BY serial")?;
            let mapped = stmt.query_map([], |row| row.get::<_, String>(0))?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(serials)
    }

    /// Merges `incoming_value` into the stored value for `(serial, key)` and
    /// persists the result.
    ///
    /// The stored revision never decreases: a merge that changed the value
    /// advances it past the previous revision even when the device reports a
    /// stale one. While a fan timer is active, the timer fields of the
    /// previous value are carried over unless the incoming payload is an
    /// explicit fan-off.
    pub async fn upsert(
        &self,
        serial: &str,
        key: &str,
        incoming_revision: Revision,
        incoming_timestamp: EpochMillis,
        incoming_value: Value,
    ) -> Result<DeviceObject> {
        let key_lock = self.key_lock(serial, key);
        let _guard = key_lock.lock().await;

        let existing = self.get(serial, key).await?;
        let now = epoch_ms();

        let mut merged = merge::deep_merge(
            existing.as_ref().map(|obj| &obj.value),
            Some(&incoming_value),
        );
        if let Some(existing) = &existing {
            if merge::has_active_fan_timer(&existing.value, now / 1000)
                && !merge::is_explicit_fan_off(&incoming_value)
            {
                merge::preserve_fan_timer(&existing.value, &mut merged);
            }
        }

        let revision = match &existing {
            Some(prev) if merged == prev.value => prev.object_revision.max(incoming_revision),
            Some(prev) => (prev.object_revision + 1).max(incoming_revision),
            None => incoming_revision,
        };

        let value_json = serde_json::to_string(&merged).context("Serializing merged value")?;
        {
            let conn = self.db.conn().await;
            self.retry_once(|| {
                conn.execute(
                    "INSERT INTO states \
                     (serial, object_key, object_revision, object_timestamp, value_json, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT (serial, object_key) DO UPDATE SET \
                     object_revision = excluded.object_revision, \
                     object_timestamp = excluded.object_timestamp, \
                     value_json = excluded.value_json, \
                     updated_at = excluded.updated_at",
                    (serial, key, revision, incoming_timestamp, &value_json, now),
                )
            })?;
        }

        Ok(DeviceObject {
            serial: serial.to_string(),
            object_key: key.to_string(),
            object_revision: revision,
            object_timestamp: incoming_timestamp,
            value: merged,
            updated_at: now,
        })
    }

    /// Runs a statement, retrying exactly once on transient lock errors.
    fn retry_once<T>(
        &self,
        mut op: impl FnMut() -> rusqlite::Result<T>,
    ) -> Result<T> {
        match op() {
            Ok(result) => Ok(result),
            Err(err) if db::is_transient(&err) => {
                warn!("Transient database error, retrying once: {err}");
                op().context("Database unavailable")
            }
            Err(err) => Err(err).context("Database error"),
        }
    }

    fn key_lock(&self, serial: &str, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks.len() > KEY_LOCK_PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry((serial.to_string(), key.to_string()))
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store() -> ObjectStore {
        ObjectStore::new(Arc::new(Db::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn upsert_creates_and_reads_back() {
        let store = test_store();
        let written = store
            .upsert("A", "device.A", 1, 1000, json!({"temperature": 20}))
            .await
            .unwrap();
        assert_eq!(written.object_revision, 1);
        assert_eq!(written.object_timestamp, 1000);

        let read = store.get("A", "device.A").await.unwrap().unwrap();
        assert_eq!(read.value, json!({"temperature": 20}));
        assert!(store.get("A", "shared.A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_write_preserves_active_fan_timer() {
        let store = test_store();
        store
            .upsert(
                "A",
                "device.A",
                1,
                1000,
                json!({
                    "fan_timer_timeout": 9_999_999_999_i64,
                    "fan_control_state": true,
                    "temperature": 20
                }),
            )
            .await
            .unwrap();

        let updated = store
            .upsert("A", "device.A", 2, 1100, json!({"temperature": 21}))
            .await
            .unwrap();
        assert_eq!(
            updated.value,
            json!({
                "fan_timer_timeout": 9_999_999_999_i64,
                "fan_control_state": true,
                "temperature": 21
            })
        );
        assert!(updated.object_revision >= 2);
    }

    #[tokio::test]
    async fn explicit_fan_off_defeats_preservation() {
        let store = test_store();
        store
            .upsert(
                "A",
                "device.A",
                1,
                1000,
                json!({
                    "fan_timer_timeout": 9_999_999_999_i64,
                    "fan_control_state": true,
                    "temperature": 20
                }),
            )
            .await
            .unwrap();

        let updated = store
            .upsert("A", "device.A", 3, 1200, json!({"fan_timer_timeout": 0}))
            .await
            .unwrap();
        assert_eq!(updated.value["fan_timer_timeout"], json!(0));
        // the earlier control state merges through untouched, but is no
        // longer re-injected on subsequent partial writes
        let after = store
            .upsert(
                "A",
                "device.A",
                4,
                1300,
                json!({"fan_control_state": false}),
            )
            .await
            .unwrap();
        assert_eq!(after.value["fan_control_state"], json!(false));
        assert_eq!(after.value["fan_timer_timeout"], json!(0));
    }

    #[tokio::test]
    async fn expired_fan_timer_is_not_preserved() {
        let store = test_store();
        store
            .upsert(
                "A",
                "device.A",
                1,
                1000,
                json!({"fan_timer_timeout": 1_000, "fan_control_state": true}),
            )
            .await
            .unwrap();
        let updated = store
            .upsert(
                "A",
                "device.A",
                2,
                1100,
                json!({"fan_timer_timeout": 0, "fan_control_state": false}),
            )
            .await
            .unwrap();
        assert_eq!(updated.value["fan_control_state"], json!(false));
    }

    #[tokio::test]
    async fn revision_never_regresses() {
        let store = test_store();
        store
            .upsert("A", "shared.A", 7, 1000, json!({"target_temperature": 20.0}))
            .await
            .unwrap();

        // stale incoming revision with a changed value still advances
        let updated = store
            .upsert("A", "shared.A", 2, 1100, json!({"target_temperature": 21.0}))
            .await
            .unwrap();
        assert_eq!(updated.object_revision, 8);

        // identical value: revision is kept at the max of both sides
        let same = store
            .upsert("A", "shared.A", 3, 1200, json!({"target_temperature": 21.0}))
            .await
            .unwrap();
        assert_eq!(same.object_revision, 8);
        let bumped = store
            .upsert("A", "shared.A", 12, 1300, json!({"target_temperature": 21.0}))
            .await
            .unwrap();
        assert_eq!(bumped.object_revision, 12);
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_key_serialize() {
        let store = Arc::new(test_store());
        let mut handles = Vec::new();
        for i in 0..16_i64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut fields = serde_json::Map::new();
                fields.insert(format!("f{i}"), json!(i));
                store
                    .upsert("A", "device.A", i, 1000 + i, Value::Object(fields))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let merged = store.get("A", "device.A").await.unwrap().unwrap();
        let map = merged.value.as_object().unwrap();
        assert_eq!(map.len(), 16);
        assert!(merged.object_revision >= 15);
    }

    #[tokio::test]
    async fn malformed_stored_json_reads_as_absent() {
        let store = test_store();
        store
            .upsert("A", "device.A", 1, 1000, json!({"a": 1}))
            .await
            .unwrap();
        {
            let conn = store.db.conn().await;
            conn.execute(
                "UPDATE states SET value_json = 'not json' WHERE serial = 'A'",
                [],
            )
            .unwrap();
        }
        assert!(store.get("A", "device.A").await.unwrap().is_none());
        assert!(store.get_all_for_device("A").await.unwrap().is_empty());
        // a fresh write recovers the key
        let recovered = store
            .upsert("A", "device.A", 5, 2000, json!({"b": 2}))
            .await
            .unwrap();
        assert_eq!(recovered.value, json!({"b": 2}));
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = ObjectStore::new(Arc::new(Db::open(&path).unwrap()));
            store
                .upsert("A", "device.A", 3, 1000, json!({"temperature": 19.5}))
                .await
                .unwrap();
        }
        let store = ObjectStore::new(Arc::new(Db::open(&path).unwrap()));
        let read = store.get("A", "device.A").await.unwrap().unwrap();
        assert_eq!(read.object_revision, 3);
        assert_eq!(read.value["temperature"], json!(19.5));
        assert_eq!(store.device_serials().await.unwrap(), vec!["A"]);
    }
}
