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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::config::Config;
use crate::integrations::IntegrationManager;
use crate::reconciler::Reconciler;
use crate::state_service::DeviceStateService;
use crate::store::db::Db;
use crate::store::ObjectStore;
use crate::subscriptions::SubscriptionManager;
use crate::users::UserStore;
use crate::watchdog::AvailabilityWatchdog;
use crate::weather::WeatherService;

mod api;
mod config;
mod integrations;
mod logging;
mod object;
mod reconciler;
mod state_service;
mod store;
mod subscriptions;
mod users;
mod watchdog;
mod weather;

const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");

/// Self-hosted cloud services for liberated smart thermostats
#[derive(Parser, Debug)]
#[clap(author, about, long_about = None)]
struct Args {
    /// Log at debug level
    #[clap(long)]
    debug: bool,

    /// Print version information and exit
    #[clap(long, short)]
    version: bool,

    /// Validate the configuration file and exit
    #[clap(long)]
    config: bool,

    /// Use an alternate configuration directory
    #[clap(long)]
    config_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd_args: Args = Args::parse();
    if cmd_args.version {
        println!("hearthd v{}", VERSION.unwrap_or("unknown"));
        return Ok(());
    }
    logging::init(cmd_args.debug)?;
    info!("Initializing...");

    let config = Config::load_config_file(cmd_args.config_dir.as_deref()).await?;
    if cmd_args.config {
        std::process::exit(0);
    }
    let settings = Arc::new(config.settings()?);

    let db = Arc::new(Db::open(&settings.db_path).context("Opening the device state database")?);
    let store = Arc::new(ObjectStore::new(Arc::clone(&db)));
    let users = Arc::new(UserStore::new(Arc::clone(&db)));
    let weather = Arc::new(WeatherService::new(
        Arc::clone(&db),
        settings.weather_cache_ttl,
    ));
    let subscriptions = Arc::new(SubscriptionManager::new());
    let watchdog = Arc::new(AvailabilityWatchdog::new(
        settings.availability_timeout,
        settings.availability_check_interval,
    ));
    let state = Arc::new(DeviceStateService::new(
        store,
        Arc::clone(&watchdog),
        Arc::clone(&subscriptions),
    ));

    let cancel_token = CancellationToken::new();
    let integrations = Arc::new(IntegrationManager::new(
        Arc::clone(&state),
        Arc::clone(&users),
        Arc::clone(&weather),
        Arc::clone(&settings),
        cancel_token.child_token(),
    ));
    state.register_observer(Arc::clone(&integrations) as _);
    state.register_observer(Arc::new(Reconciler::new(
        Arc::clone(&state),
        Arc::clone(&users),
        Arc::clone(&weather),
    )));

    // availability transitions fan out through the state service observers
    {
        let state = Arc::clone(&state);
        watchdog.set_availability_change_handler(Arc::new(move |serial, available| {
            let state = Arc::clone(&state);
            let serial = serial.to_string();
            tokio::spawn(async move {
                state.dispatch_availability_change(&serial, available).await;
            });
        }));
    }
    Arc::clone(&watchdog).start(Arc::clone(&subscriptions), &cancel_token);
    integrations.start_all().await;

    let app_state = AppState {
        state,
        subscriptions,
        users,
        weather,
        settings,
    };
    let server = tokio::spawn(api::start_server(app_state, cancel_token.clone()));
    info!("Daemon successfully initialized");

    wait_for_term_signal().await;
    info!("Main process shutting down");
    cancel_token.cancel();
    integrations.shutdown_all().await;
    watchdog.stop();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("API server error: {err:#}"),
        Err(err) => error!("API server task error: {err}"),
    }
    info!("Shutdown Complete");
    Ok(())
}

async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!("Could not register SIGTERM handler: {err}");
            return;
        }
    };
    let mut sigquit = match signal(SignalKind::quit()) {
        Ok(sigquit) => sigquit,
        Err(err) => {
            error!("Could not register SIGQUIT handler: {err}");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
        _ = sigquit.recv() => {}
    }
}
