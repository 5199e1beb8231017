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

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Serial = String;
pub type UserId = String;
pub type ObjectKey = String;
pub type Revision = i64;
pub type EpochMillis = i64;

/// A single versioned sub-document of a device, keyed by `(serial, object_key)`.
///
/// `object_key` follows the device protocol convention `«type».«id»`, where
/// the type is one of `device`, `shared`, `user`, `structure`, `schedule`,
/// `weather`, `device_alert_dialog` and the id is usually the serial or a
/// user id. The `value` is an arbitrarily nested JSON document as the device
/// firmware reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceObject {
    pub serial: Serial,
    pub object_key: ObjectKey,
    pub object_revision: Revision,
    pub object_timestamp: EpochMillis,
    pub value: Value,
    #[serde(rename = "updatedAt")]
    pub updated_at: EpochMillis,
}

impl DeviceObject {
    /// The `«type»` half of the object key.
    pub fn object_type(&self) -> &str {
        object_type(&self.object_key)
    }
}

/// Returns the `«type»` portion of an object key, i.e. everything before the
/// first dot. Keys without a dot are their own type.
pub fn object_type(key: &str) -> &str {
    key.split_once('.').map_or(key, |(t, _)| t)
}

/// Returns the `«id»` portion of an object key, empty if the key has no dot.
pub fn object_id(key: &str) -> &str {
    key.split_once('.').map_or("", |(_, id)| id)
}

pub fn device_key(serial: &str) -> ObjectKey {
    format!("device.{serial}")
}

pub fn shared_key(serial: &str) -> ObjectKey {
    format!("shared.{serial}")
}

pub fn user_key(user_id: &str) -> ObjectKey {
    format!("user.{user_id}")
}

/// Current wall-clock time as epoch milliseconds, the timestamp unit used
/// throughout the device protocol.
pub fn epoch_ms() -> EpochMillis {
    Utc::now().timestamp_millis()
}
