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

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::AppState;
use crate::VERSION;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    devices: usize,
    #[serde(rename = "openSubscriptions")]
    open_subscriptions: usize,
}

pub async fn health(State(app): State<AppState>) -> Json<HealthResponse> {
    let devices = app.state.device_serials().await.map_or(0, |s| s.len());
    Json(HealthResponse {
        status: "ok",
        version: VERSION.unwrap_or("unknown"),
        devices,
        open_subscriptions: app.subscriptions.open_waiter_count(),
    })
}
