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

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace};
use tokio_util::sync::CancellationToken;

use crate::object::Serial;
use crate::subscriptions::SubscriptionManager;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(300_000);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(30_000);

pub type AvailabilityHandler = Arc<dyn Fn(&str, bool) + Send + Sync>;

struct Liveness {
    last_seen: Instant,
    available: bool,
}

/// Tracks when each device was last heard from and judges fleet liveness.
///
/// A device is available from its first touch until it has been silent for
/// the configured timeout. Serials with an open long-poll session count as
/// continuously seen. Unknown serials report as unavailable.
pub struct AvailabilityWatchdog {
    timeout: Duration,
    check_interval: Duration,
    devices: std::sync::Mutex<HashMap<Serial, Liveness>>,
    handler: std::sync::RwLock<Option<AvailabilityHandler>>,
    sweep_cancel: std::sync::Mutex<Option<CancellationToken>>,
}

impl AvailabilityWatchdog {
    pub fn new(timeout: Duration, check_interval: Duration) -> Self {
        Self {
            timeout,
            check_interval,
            devices: std::sync::Mutex::new(HashMap::new()),
            handler: std::sync::RwLock::new(None),
            sweep_cancel: std::sync::Mutex::new(None),
        }
    }

    /// Registers the single callback invoked on every availability
    /// transition. Panics inside the handler are contained so the sweep
    /// keeps running.
    pub fn set_availability_change_handler(&self, handler: AvailabilityHandler) {
        *self.handler.write().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    pub fn mark_seen(&self, serial: &str) {
        let transition = {
            let mut devices = self.devices.lock().unwrap_or_else(|p| p.into_inner());
            let entry = devices.entry(serial.to_string()).or_insert(Liveness {
                last_seen: Instant::now(),
                available: false,
            });
            entry.last_seen = Instant::now();
            if entry.available {
                None
            } else {
                entry.available = true;
                Some(true)
            }
        };
        if let Some(available) = transition {
            debug!("Device {serial} is now available");
            self.emit(serial, available);
        }
    }

    pub fn get_availability(&self, serial: &str) -> bool {
        self.devices
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(serial)
            .is_some_and(|liveness| liveness.available)
    }

    pub fn force_unavailable(&self, serial: &str) {
        let transitioned = {
            let mut devices = self.devices.lock().unwrap_or_else(|p| p.into_inner());
            match devices.get_mut(serial) {
                Some(liveness) if liveness.available => {
                    liveness.available = false;
                    true
                }
                _ => false,
            }
        };
        if transitioned {
            info!("Device {serial} forced unavailable");
            self.emit(serial, false);
        }
    }

    /// One liveness pass: serials holding a long-poll session are refreshed
    /// as seen, then every available device silent past the timeout flips to
    /// unavailable.
    pub fn sweep(&self, active_serials: &HashSet<Serial>) {
        let now = Instant::now();
        let mut transitions: Vec<(Serial, bool)> = Vec::new();
        {
            let mut devices = self.devices.lock().unwrap_or_else(|p| p.into_inner());
            for serial in active_serials {
                let entry = devices.entry(serial.clone()).or_insert(Liveness {
                    last_seen: now,
                    available: false,
                });
                entry.last_seen = now;
                if !entry.available {
                    entry.available = true;
                    transitions.push((serial.clone(), true));
                }
            }
            for (serial, liveness) in devices.iter_mut() {
                if liveness.available && now.duration_since(liveness.last_seen) > self.timeout {
                    liveness.available = false;
                    transitions.push((serial.clone(), false));
                }
            }
        }
        for (serial, available) in transitions {
            if available {
                debug!("Device {serial} is now available (open subscription)");
            } else {
                info!("Device {serial} went silent, marking unavailable");
            }
            self.emit(&serial, available);
        }
    }

    /// Spawns the periodic sweep task. Stopped by `stop()` or process
    /// shutdown via the parent token.
    pub fn start(self: Arc<Self>, subscriptions: Arc<SubscriptionManager>, parent: &CancellationToken) {
        let cancel = parent.child_token();
        {
            let mut slot = self.sweep_cancel.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(previous) = slot.replace(cancel.clone()) {
                previous.cancel();
            }
        }
        let watchdog = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watchdog.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        trace!("Availability sweep");
                        watchdog.sweep(&subscriptions.active_serials());
                    }
                }
            }
            debug!("Availability sweep stopped");
        });
    }

    pub fn stop(&self) {
        if let Some(cancel) = self
            .sweep_cancel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            cancel.cancel();
        }
    }

    fn emit(&self, serial: &str, available: bool) {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(handler) = handler {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(serial, available)));
            if result.is_err() {
                error!("Availability change handler panicked for {serial}");
            }
        }
    }
}
