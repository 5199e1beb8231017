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

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::Json;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{ApiError, AppState};
use crate::object::{DeviceObject, EpochMillis, ObjectKey, Revision, Serial};
use crate::users::AuthPolicy;

/// Long polls are capped regardless of what the device asks for.
pub(crate) const MAX_LONG_POLL: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
pub struct EntryQuery {
    serial: Option<Serial>,
}

#[derive(Debug, Serialize)]
pub struct EntryResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    transport_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    weather_url: Option<String>,
}

/// Device check-in. Echoes the provisioning parameters the replacement
/// firmware expects and refreshes the device's liveness.
pub async fn entry(
    State(app): State<AppState>,
    Query(query): Query<EntryQuery>,
) -> Json<EntryResponse> {
    if let Some(serial) = query.serial.as_deref().filter(|s| !s.is_empty()) {
        debug!("Entry check-in from {serial}");
        app.state.mark_seen(serial);
    }
    Json(EntryResponse {
        ok: true,
        transport_url: app.settings.transport_url.clone(),
        weather_url: app.settings.weather_url.clone(),
    })
}

#[derive(Debug, Deserialize)]
pub struct IncomingObject {
    serial: Serial,
    object_key: ObjectKey,
    object_revision: Revision,
    object_timestamp: EpochMillis,
    value: Value,
}

#[derive(Debug, Deserialize)]
pub struct PutRequest {
    objects: Vec<IncomingObject>,
}

#[derive(Debug, Serialize)]
pub struct PutResponse {
    accepted: usize,
}

/// Device state writes. Every entry is validated and authorized before any
/// of them lands, so a rejected request has no partial effect.
pub async fn put_objects(
    State(app): State<AppState>,
    body: Result<Json<PutRequest>, JsonRejection>,
) -> Result<Json<PutResponse>, ApiError> {
    let Json(request) = body?;
    for incoming in &request.objects {
        if incoming.serial.is_empty() {
            return Err(ApiError::Unauthorized {
                msg: "Write without a device serial".to_string(),
            });
        }
        if incoming.object_key.is_empty() {
            return Err(ApiError::UserError {
                msg: format!("Write for {} without an object key", incoming.serial),
            });
        }
        authorize_serial(&app, &incoming.serial).await?;
    }

    let mut accepted = 0;
    for incoming in request.objects {
        app.state
            .upsert(
                &incoming.serial,
                &incoming.object_key,
                incoming.object_revision,
                incoming.object_timestamp,
                incoming.value,
            )
            .await
            .map_err(ApiError::storage)?;
        accepted += 1;
    }
    Ok(Json(PutResponse { accepted }))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    serial: Serial,
    #[serde(default)]
    keys: Option<Vec<ObjectKey>>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SubscribeResponse {
    objects: Vec<DeviceObject>,
}

/// Long poll for state changes. Responds with the first matching mutation,
/// or an empty object list once the deadline passes. Dropping the request
/// (device hangup) cancels the waiter.
pub async fn subscribe(
    State(app): State<AppState>,
    body: Result<Json<SubscribeRequest>, JsonRejection>,
) -> Result<Json<SubscribeResponse>, ApiError> {
    let Json(request) = body?;
    if request.serial.is_empty() {
        return Err(ApiError::Unauthorized {
            msg: "Subscribe without a device serial".to_string(),
        });
    }
    authorize_serial(&app, &request.serial).await?;

    let timeout = request
        .timeout_ms
        .map_or(app.settings.long_poll_timeout, Duration::from_millis)
        .min(MAX_LONG_POLL);
    app.state.mark_seen(&request.serial);
    let waiter =
        Arc::clone(&app.subscriptions).register(&request.serial, "subscribe", request.keys);
    let objects = match waiter.wait(timeout).await {
        Some(updated) => vec![updated],
        None => Vec::new(),
    };
    Ok(Json(SubscribeResponse { objects }))
}

async fn authorize_serial(app: &AppState, serial: &str) -> Result<(), ApiError> {
    match app.settings.auth_policy {
        AuthPolicy::Open => Ok(()),
        AuthPolicy::Registered => {
            let registered = app
                .users
                .serial_registered(serial)
                .await
                .map_err(ApiError::storage)?;
            if registered {
                Ok(())
            } else {
                Err(ApiError::Forbidden {
                    msg: format!("Serial {serial} is not paired with any user"),
                })
            }
        }
    }
}
