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

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, trace};
use serde_json::{json, Map, Value};

use crate::object::{device_key, epoch_ms, object_type, user_key, Serial};
use crate::state_service::{DeviceStateChange, DeviceStateService, StateObserver};
use crate::users::UserStore;
use crate::weather::{WeatherService, DEFAULT_COUNTRY};

/// Derives per-user summary state from all of a user's devices and writes it
/// back onto each owned device's `user.«userId»` object.
///
/// A household is away only when every reporting device says so; vacation
/// mode and the most recent away/manual-away timestamps are carried along.
/// When any owned device knows its postal code and a weather snapshot is
/// cached for it, the snapshot is mirrored under the user object as well.
pub struct Reconciler {
    service: Arc<DeviceStateService>,
    users: Arc<UserStore>,
    weather: Arc<WeatherService>,
}

struct AwaySummary {
    away: bool,
    vacation_mode: bool,
    away_timestamp: Option<i64>,
    manual_away_timestamp: Option<i64>,
    away_setter: Option<Value>,
}

impl Reconciler {
    pub fn new(
        service: Arc<DeviceStateService>,
        users: Arc<UserStore>,
        weather: Arc<WeatherService>,
    ) -> Self {
        Self {
            service,
            users,
            weather,
        }
    }

    /// Recomputes and writes the user summary for every owner of `serial`.
    pub async fn reconcile_serial(&self, serial: &str) -> Result<()> {
        for user_id in self.users.owners_of(serial).await? {
            self.reconcile_user(&user_id).await?;
        }
        Ok(())
    }

    pub async fn reconcile_user(&self, user_id: &str) -> Result<()> {
        let owned: Vec<Serial> = self.users.owned_devices(user_id).await?.into_iter().collect();
        if owned.is_empty() {
            return Ok(());
        }

        let mut device_values: Vec<Value> = Vec::with_capacity(owned.len());
        for serial in &owned {
            if let Some(device) = self.service.get(serial, &device_key(serial)).await? {
                device_values.push(device.value);
            }
        }

        let summary = summarize_away(&device_values);
        let weather = self.lookup_weather(&device_values).await;

        let mut user_value = Map::new();
        user_value.insert("away".into(), json!(summary.away));
        user_value.insert("vacation_mode".into(), json!(summary.vacation_mode));
        if let Some(ts) = summary.away_timestamp {
            user_value.insert("away_timestamp".into(), json!(ts));
        }
        if let Some(ts) = summary.manual_away_timestamp {
            user_value.insert("manual_away_timestamp".into(), json!(ts));
        }
        if let Some(setter) = summary.away_setter {
            user_value.insert("away_setter".into(), setter);
        }
        if let Some(weather) = weather {
            user_value.insert("weather".into(), weather);
        }
        let user_value = Value::Object(user_value);

        let key = user_key(user_id);
        let now = epoch_ms();
        for serial in &owned {
            let next_revision = self
                .service
                .get(serial, &key)
                .await?
                .map_or(1, |existing| existing.object_revision + 1);
            self.service
                .upsert(serial, &key, next_revision, now, user_value.clone())
                .await?;
        }
        debug!(
            "Reconciled user {user_id} across {} device(s): away={}",
            owned.len(),
            summary.away
        );
        Ok(())
    }

    async fn lookup_weather(&self, device_values: &[Value]) -> Option<Value> {
        let (postal_code, country) = device_values.iter().find_map(|value| {
            let postal = value.get("postal_code")?.as_str()?;
            if postal.is_empty() {
                return None;
            }
            let country = value
                .get("country")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .unwrap_or(DEFAULT_COUNTRY);
            Some((postal.to_string(), country.to_string()))
        })?;
        let report = self.weather.get(&postal_code, &country).await?;
        Some(json!({
            "current": report.current,
            "location": report.location,
            "updatedAt": report.updated_at,
        }))
    }
}

fn summarize_away(device_values: &[Value]) -> AwaySummary {
    let mut any_reported = false;
    let mut all_away = true;
    let mut vacation_mode = false;
    let mut away_timestamp: Option<i64> = None;
    let mut manual_away_timestamp: Option<i64> = None;
    let mut away_setter: Option<Value> = None;

    for value in device_values {
        any_reported = true;
        if !value.get("away").and_then(Value::as_bool).unwrap_or(false) {
            all_away = false;
        }
        if value
            .get("vacation_mode")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            vacation_mode = true;
        }
        if let Some(ts) = value.get("away_timestamp").and_then(Value::as_i64) {
            away_timestamp = Some(away_timestamp.map_or(ts, |max| max.max(ts)));
        }
        if let Some(ts) = value.get("manual_away_timestamp").and_then(Value::as_i64) {
            if manual_away_timestamp.is_none_or(|max| ts > max) {
                manual_away_timestamp = Some(ts);
                away_setter = value.get("away_setter").cloned();
            }
        }
    }

    AwaySummary {
        away: any_reported && all_away,
        vacation_mode,
        away_timestamp,
        manual_away_timestamp,
        away_setter,
    }
}

#[async_trait]
impl StateObserver for Reconciler {
    fn name(&self) -> &'static str {
        "reconciler"
    }

    async fn on_state_change(&self, change: &DeviceStateChange) -> Result<()> {
        if object_type(&change.object_key) != "device" {
            return Ok(());
        }
        trace!("Device change on {} triggers reconciliation", change.serial);
        self.reconcile_serial(&change.serial).await
    }

    async fn on_availability_change(&self, _serial: &str, _available: bool) -> Result<()> {
        Ok(())
    }
}
