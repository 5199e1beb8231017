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

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::{ApiError, AppState};
use crate::object::{device_key, ObjectKey, Serial};
use crate::weather::DEFAULT_COUNTRY;

/// Object key prefixes exposed to the frontend console.
const VISIBLE_PREFIXES: [&str; 5] = ["user.", "device.", "shared.", "schedule.", "structure."];

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    serial: Option<Serial>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    devices: Vec<Serial>,
    #[serde(rename = "deviceState")]
    device_state: HashMap<Serial, HashMap<ObjectKey, Value>>,
}

/// Read view for the frontend console: every device's visible objects, with
/// the cached weather snapshot injected per serial when available. Asking
/// for a serial the store has never heard of is a 404.
pub async fn retrieve(
    State(app): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let requested = query.serial;
    let devices: Vec<Serial> = match &requested {
        Some(serial) => vec![serial.clone()],
        None => app
            .state
            .device_serials()
            .await
            .map_err(ApiError::storage)?,
    };

    let mut device_state = HashMap::with_capacity(devices.len());
    for serial in &devices {
        let objects = app
            .state
            .get_all_for_device(serial)
            .await
            .map_err(ApiError::storage)?;
        if objects.is_empty() && requested.is_some() {
            return Err(ApiError::NotFound {
                msg: format!("No state stored for device {serial}"),
            });
        }
        let mut visible: HashMap<ObjectKey, Value> = objects
            .into_iter()
            .filter(|(key, _)| VISIBLE_PREFIXES.iter().any(|prefix| key.starts_with(prefix)))
            .map(|(key, object)| (key, serde_json::to_value(object).unwrap_or(Value::Null)))
            .collect();
        if let Some(weather) = weather_for(&app, &visible, serial).await {
            visible.insert(format!("weather.{serial}"), weather);
        }
        device_state.insert(serial.clone(), visible);
    }
    Ok(Json(StatusResponse {
        devices,
        device_state,
    }))
}

async fn weather_for(
    app: &AppState,
    visible: &HashMap<ObjectKey, Value>,
    serial: &str,
) -> Option<Value> {
    let device = visible.get(&device_key(serial))?;
    let device_value = device.get("value")?;
    let postal_code = device_value.get("postal_code")?.as_str()?;
    if postal_code.is_empty() {
        return None;
    }
    let country = device_value
        .get("country")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_COUNTRY);
    let report = app.weather.get(postal_code, country).await?;
    Some(json!({
        "current": report.current,
        "location": report.location,
        "updatedAt": report.updated_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::state_service::DeviceStateService;
    use crate::store::db::Db;
    use crate::store::ObjectStore;
    use crate::subscriptions::SubscriptionManager;
    use crate::users::{AuthPolicy, UserStore};
    use crate::watchdog::{AvailabilityWatchdog, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT};
    use crate::weather::WeatherService;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    async fn test_app() -> (AppState, Arc<Db>) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let subscriptions = Arc::new(SubscriptionManager::new());
        let app = AppState {
            state: Arc::new(DeviceStateService::new(
                Arc::new(ObjectStore::new(Arc::clone(&db))),
                Arc::new(AvailabilityWatchdog::new(
                    DEFAULT_TIMEOUT,
                    DEFAULT_CHECK_INTERVAL,
                )),
                Arc::clone(&subscriptions),
            )),
            subscriptions,
            users: Arc::new(UserStore::new(Arc::clone(&db))),
            weather: Arc::new(WeatherService::new(
                Arc::clone(&db),
                Duration::from_secs(1800),
            )),
            settings: Arc::new(Settings {
                db_path: PathBuf::from(":memory:"),
                address: None,
                port: 3000,
                transport_url: None,
                weather_url: None,
                auth_policy: AuthPolicy::Open,
                availability_timeout: DEFAULT_TIMEOUT,
                availability_check_interval: DEFAULT_CHECK_INTERVAL,
                long_poll_timeout: Duration::from_secs(60),
                default_broker_url: None,
                mqtt_connect_timeout: Duration::from_secs(10),
                mqtt_reconnect_period: Duration::from_secs(5),
                device_list_reconcile_interval: Duration::from_secs(10),
                weather_cache_ttl: Duration::from_secs(1800),
            }),
        };
        (app, db)
    }

    #[tokio::test]
    async fn filters_to_visible_prefixes() {
        let (app, _db) = test_app().await;
        app.state
            .upsert("A", "device.A", 1, 1000, json!({"temperature": 20}))
            .await
            .unwrap();
        app.state
            .upsert("A", "metadata.A", 1, 1000, json!({"internal": true}))
            .await
            .unwrap();

        let response = retrieve(State(app), Query(StatusQuery { serial: None }))
            .await
            .unwrap();
        assert_eq!(response.0.devices, vec!["A"]);
        let objects = &response.0.device_state["A"];
        assert!(objects.contains_key("device.A"));
        assert!(!objects.contains_key("metadata.A"));
        assert_eq!(objects["device.A"]["value"]["temperature"], json!(20));
    }

    #[tokio::test]
    async fn unknown_serial_is_not_found() {
        let (app, _db) = test_app().await;
        app.state
            .upsert("A", "device.A", 1, 1000, json!({"temperature": 20}))
            .await
            .unwrap();
        let err = retrieve(
            State(app),
            Query(StatusQuery {
                serial: Some("GHOST".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::NotFound { .. }));
    }

    #[tokio::test]
    async fn injects_cached_weather() {
        let (app, db) = test_app().await;
        {
            let conn = db.conn().await;
            conn.execute(
                "INSERT INTO weather (postal_code, country, payload_json, updated_at) \
                 VALUES ('10115', 'DE', ?1, 99)",
                [json!({"current": {"temp_c": 6.5}}).to_string()],
            )
            .unwrap();
        }
        app.state
            .upsert(
                "A",
                "device.A",
                1,
                1000,
                json!({"postal_code": "10115", "country": "DE"}),
            )
            .await
            .unwrap();

        let response = retrieve(
            State(app),
            Query(StatusQuery {
                serial: Some("A".to_string()),
            }),
        )
        .await
        .unwrap();
        let objects = &response.0.device_state["A"];
        assert_eq!(objects["weather.A"]["current"]["temp_c"], json!(6.5));
    }
}
