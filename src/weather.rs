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
use std::time::Duration;

use anyhow::Result;
use log::warn;
use moka::future::Cache;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::object::EpochMillis;
use crate::store::db::Db;

pub const DEFAULT_COUNTRY: &str = "US";

/// A weather snapshot for one postal area. The actual fetching is done by an
/// external worker that fills the `weather` table; the daemon only serves
/// cached snapshots to devices and the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub current: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    #[serde(rename = "updatedAt")]
    pub updated_at: EpochMillis,
}

/// TTL-cached read access to stored weather snapshots.
pub struct WeatherService {
    db: Arc<Db>,
    cache: Cache<(String, String), Option<WeatherReport>>,
}

impl WeatherService {
    pub fn new(db: Arc<Db>, ttl: Duration) -> Self {
        Self {
            db,
            cache: Cache::builder().time_to_live(ttl).build(),
        }
    }

    /// The cached report for `(postal_code, country)`, loading from the
    /// backing table at most once per TTL window. A missing or unreadable
    /// row is cached as absent for the same window.
    pub async fn get(&self, postal_code: &str, country: &str) -> Option<WeatherReport> {
        let key = (postal_code.to_string(), country.to_string());
        self.cache
            .get_with(key, async {
                match self.load(postal_code, country).await {
                    Ok(report) => report,
                    Err(err) => {
                        warn!("Weather lookup failed for {postal_code},{country}: {err}");
                        None
                    }
                }
            })
            .await
    }

    async fn load(&self, postal_code: &str, country: &str) -> Result<Option<WeatherReport>> {
        let conn = self.db.conn().await;
        let row = conn
            .query_row(
                "SELECT payload_json, updated_at FROM weather \
                 WHERE postal_code = ?1 AND country = ?2",
                (postal_code, country),
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, EpochMillis>(1)?)),
            )
            .optional()?;
        let Some((payload_json, updated_at)) = row else {
            return Ok(None);
        };
        let payload: Value = match serde_json::from_str(&payload_json) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Unreadable weather payload for {postal_code},{country}: {err}");
                return Ok(None);
            }
        };
        Ok(Some(WeatherReport {
            current: payload.get("current").cloned().unwrap_or(Value::Null),
            location: payload.get("location").cloned(),
            updated_at,
        }))
    }
}
