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

use axum::routing::{get, post, put};
use axum::Router;

use crate::api::{base, status, transport, AppState};

pub fn init(app_state: AppState) -> Router {
    Router::new()
        // device-facing transport protocol
        .route("/entry", get(transport::entry))
        .route("/transport/put", put(transport::put_objects))
        .route("/transport/subscribe", post(transport::subscribe))
        // frontend console reads
        .route("/status", get(status::retrieve))
        .route("/health", get(base::health))
        .with_state(app_state)
}
