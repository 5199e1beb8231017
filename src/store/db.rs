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

use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard};

/// `states` is the authoritative table for all device state. The remaining
/// tables are maintained by the frontend console and pairing tooling; the
/// daemon only reads them.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS states (
    serial           TEXT    NOT NULL,
    object_key       TEXT    NOT NULL,
    object_revision  INTEGER NOT NULL,
    object_timestamp INTEGER NOT NULL,
    value_json       TEXT    NOT NULL,
    updated_at       INTEGER NOT NULL,
    PRIMARY KEY (serial, object_key)
);
CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY,
    name       TEXT,
    created_at INTEGER
);
CREATE TABLE IF NOT EXISTS device_owners (
    user_id TEXT NOT NULL,
    serial  TEXT NOT NULL,
    PRIMARY KEY (user_id, serial)
);
CREATE TABLE IF NOT EXISTS device_shares (
    owner_id            TEXT NOT NULL,
    shared_with_user_id TEXT NOT NULL,
    serial              TEXT NOT NULL,
    permissions         TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (owner_id, shared_with_user_id, serial)
);
CREATE TABLE IF NOT EXISTS entry_keys (
    entry_key  TEXT PRIMARY KEY,
    serial     TEXT,
    created_at INTEGER
);
CREATE TABLE IF NOT EXISTS weather (
    postal_code  TEXT    NOT NULL,
    country      TEXT    NOT NULL,
    payload_json TEXT    NOT NULL,
    updated_at   INTEGER NOT NULL,
    PRIMARY KEY (postal_code, country)
);
CREATE TABLE IF NOT EXISTS api_keys (
    key             TEXT PRIMARY KEY,
    user_id         TEXT,
    allowed_serials TEXT NOT NULL DEFAULT '[]',
    created_at      INTEGER
);
CREATE TABLE IF NOT EXISTS integrations (
    user_id     TEXT NOT NULL,
    type        TEXT NOT NULL,
    enabled     INTEGER NOT NULL DEFAULT 1,
    config_json TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (user_id, type)
);
";

/// Shared handle to the embedded database. All access goes through a single
/// connection behind an async mutex; statements are short-lived so the
/// serialization cost is negligible compared to device round trips.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Creating database directory {parent:?}"))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Opening database file {path:?}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Enabling WAL journal mode")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)
            .context("Initializing database schema")?;
        info!("Database opened: {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory database with the full schema, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Opening in-memory database")?;
        conn.execute_batch(SCHEMA)
            .context("Initializing database schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

/// Whether a database error is worth a single retry. Lock contention and
/// busy timeouts are transient; everything else is surfaced as-is.
pub fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}
