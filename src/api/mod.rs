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

mod base;
mod router;
mod status;
mod transport;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use derive_more::{Display, Error};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::normalize_path::NormalizePathLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::state_service::DeviceStateService;
use crate::subscriptions::SubscriptionManager;
use crate::users::UserStore;
use crate::weather::WeatherService;

/// Device payloads are small; 2MB leaves generous headroom for batched puts.
const BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub state: Arc<DeviceStateService>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub users: Arc<UserStore>,
    pub weather: Arc<WeatherService>,
    pub settings: Arc<Settings>,
}

pub async fn start_server(app_state: AppState, cancel_token: CancellationToken) -> Result<()> {
    let settings = Arc::clone(&app_state.settings);
    let ip: IpAddr = match &settings.address {
        Some(address) => address
            .parse()
            .with_context(|| format!("Parsing listen address {address}"))?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let addr = SocketAddr::new(ip, settings.port);
    // the request timeout has to outlive the longest permitted long poll
    let request_timeout = transport::MAX_LONG_POLL + Duration::from_secs(15);

    let router = router::init(app_state).layer((
        RequestBodyLimitLayer::new(BODY_LIMIT_BYTES),
        TraceLayer::new_for_http(),
        TimeoutLayer::new(request_timeout),
        NormalizePathLayer::trim_trailing_slash(),
        cors_layer(),
    ));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Binding device API to {addr}"))?;
    info!("Device API bound to address: {addr}");
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { cancel_token.cancelled().await })
        .await?;
    Ok(())
}

fn cors_layer() -> cors::CorsLayer {
    // the frontend console may be served from anywhere on the home network
    cors::CorsLayer::new()
        .allow_headers(cors::AllowHeaders::mirror_request())
        .allow_methods(cors::AllowMethods::mirror_request())
        .allow_origin(cors::AllowOrigin::mirror_request())
        .max_age(Duration::from_secs(60) * 5)
}

/// How we want error responses to be serialized
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Clone, Display, Error, Serialize, Deserialize)]
pub enum ApiError {
    #[display("Internal Error: {msg}")]
    InternalError { msg: String },

    #[display("{msg}")]
    UserError { msg: String },

    #[display("{msg}")]
    Unauthorized { msg: String },

    #[display("{msg}")]
    Forbidden { msg: String },

    #[display("Resource not found: {msg}")]
    NotFound { msg: String },

    #[display("State store unavailable: {msg}")]
    StorageUnavailable { msg: String },
}

impl ApiError {
    pub fn storage(err: anyhow::Error) -> Self {
        ApiError::StorageUnavailable {
            msg: format!("{err:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err_msg = self.to_string();
        let status = match self {
            ApiError::InternalError { .. } => {
                warn!("{err_msg}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::UserError { .. } => {
                debug!("{err_msg}");
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthorized { .. } => {
                debug!("{err_msg}");
                StatusCode::UNAUTHORIZED
            }
            ApiError::Forbidden { .. } => {
                debug!("{err_msg}");
                StatusCode::FORBIDDEN
            }
            ApiError::NotFound { .. } => {
                debug!("{err_msg}");
                StatusCode::NOT_FOUND
            }
            ApiError::StorageUnavailable { .. } => {
                warn!("{err_msg}");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        (status, Json(ErrorResponse { error: err_msg })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(underlying_error) = err.downcast_ref::<ApiError>() {
            underlying_error.clone()
        } else {
            ApiError::InternalError {
                msg: format!("{err:#}"),
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::UserError {
            msg: rejection.body_text(),
        }
    }
}
