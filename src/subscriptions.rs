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
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::object::{DeviceObject, ObjectKey, Serial};

pub type SessionId = String;

struct WaiterEntry {
    serial: Serial,
    endpoint: String,
    watched_keys: Option<HashSet<ObjectKey>>,
    started_at: Instant,
    tx: oneshot::Sender<DeviceObject>,
}

/// Registry of open long-poll sessions.
///
/// Each waiter is delivered to at most once; delivery, timeout and
/// cancellation all close it. The registry never outlives the HTTP request:
/// the handle returned by `register` deregisters itself on drop.
#[derive(Default)]
pub struct SubscriptionManager {
    waiters: std::sync::Mutex<HashMap<SessionId, WaiterEntry>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a waiter for `serial`. When `keys` is given, only mutations of
    /// those object keys wake it; otherwise any key on the serial matches.
    /// The consumed `Arc` lives on inside the returned handle.
    pub fn register(
        self: Arc<Self>,
        serial: &str,
        endpoint: &str,
        keys: Option<Vec<ObjectKey>>,
    ) -> WaiterHandle {
        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let entry = WaiterEntry {
            serial: serial.to_string(),
            endpoint: endpoint.to_string(),
            watched_keys: keys.map(|keys| keys.into_iter().collect()),
            started_at: Instant::now(),
            tx,
        };
        trace!("Waiter {session_id} registered for {serial} via {endpoint}");
        self.waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(session_id.clone(), entry);
        WaiterHandle {
            session_id,
            serial: serial.to_string(),
            rx: Some(rx),
            manager: self,
        }
    }

    /// Wakes every waiter matching `(serial, key)` with the updated object
    /// and closes it. Returns how many waiters were delivered to.
    pub fn notify(&self, serial: &str, key: &str, updated: &DeviceObject) -> usize {
        let matched: Vec<(SessionId, WaiterEntry)> = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|p| p.into_inner());
            let session_ids: Vec<SessionId> = waiters
                .iter()
                .filter(|(_, entry)| {
                    entry.serial == serial
                        && entry
                            .watched_keys
                            .as_ref()
                            .is_none_or(|watched| watched.contains(key))
                })
                .map(|(id, _)| id.clone())
                .collect();
            session_ids
                .into_iter()
                .filter_map(|id| waiters.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        let mut notified = 0;
        for (session_id, entry) in matched {
            let waited = entry.started_at.elapsed();
            if entry.tx.send(updated.clone()).is_ok() {
                notified += 1;
                debug!(
                    "Waiter {session_id} for {serial} woken by {key} after {waited:?}"
                );
            }
        }
        notified
    }

    /// Closes a waiter without delivery. Safe to call after delivery or a
    /// second time; both are no-ops.
    pub fn cancel(&self, session_id: &str) {
        let removed = self
            .waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_id);
        if let Some(entry) = removed {
            trace!(
                "Waiter {session_id} for {} via {} cancelled",
                entry.serial,
                entry.endpoint
            );
        }
    }

    /// Serials with at least one open waiter, consumed by the availability
    /// sweep.
    pub fn active_serials(&self) -> HashSet<Serial> {
        self.waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|entry| entry.serial.clone())
            .collect()
    }

    pub fn open_waiter_count(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}

/// One open long-poll session. Dropping the handle (request cancelled,
/// response written) removes the waiter from the registry.
pub struct WaiterHandle {
    session_id: SessionId,
    serial: Serial,
    rx: Option<oneshot::Receiver<DeviceObject>>,
    manager: Arc<SubscriptionManager>,
}

impl WaiterHandle {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Blocks until a matching mutation arrives or the deadline passes.
    /// Returns `None` on timeout or cancellation.
    pub async fn wait(mut self, timeout: Duration) -> Option<DeviceObject> {
        let rx = self.rx.take()?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(updated)) => Some(updated),
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

impl Drop for WaiterHandle {
    fn drop(&mut self) {
        self.manager.cancel(&self.session_id);
    }
}
