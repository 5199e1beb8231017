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

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::object::{Serial, UserId};
use crate::store::db::Db;

/// Who may write state for a device serial. Pairing and share administration
/// happen in the frontend console; the daemon only consults the resulting
/// ownership records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AuthPolicy {
    /// Accept state from any serial. The default for closed home networks.
    Open,
    /// Accept state only from serials owned by or shared with a user.
    Registered,
}

/// Read-only view over the ownership and sharing records.
pub struct UserStore {
    db: Arc<Db>,
}

impl UserStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Every serial the user owns or has been shared, sorted.
    pub async fn device_set(&self, user_id: &str) -> Result<BTreeSet<Serial>> {
        let conn = self.db.conn().await;
        let mut stmt = conn
            .prepare(
                "SELECT serial FROM device_owners WHERE user_id = ?1 \
                 UNION SELECT serial FROM device_shares WHERE shared_with_user_id = ?1",
            )
            .context("Preparing device set query")?;
        let serials = stmt
            .query_map([user_id], |row| row.get::<_, String>(0))
            .context("Querying device set")?
            .collect::<rusqlite::Result<BTreeSet<_>>>()
            .context("Reading device set")?;
        Ok(serials)
    }

    /// Serials the user owns outright, excluding shares.
    pub async fn owned_devices(&self, user_id: &str) -> Result<BTreeSet<Serial>> {
        let conn = self.db.conn().await;
        let mut stmt = conn
            .prepare("SELECT serial FROM device_owners WHERE user_id = ?1")
            .context("Preparing owned devices query")?;
        let serials = stmt
            .query_map([user_id], |row| row.get::<_, String>(0))
            .context("Querying owned devices")?
            .collect::<rusqlite::Result<BTreeSet<_>>>()
            .context("Reading owned devices")?;
        Ok(serials)
    }

    /// The owners of a serial (not the shared-with users).
    pub async fn owners_of(&self, serial: &str) -> Result<Vec<UserId>> {
        let conn = self.db.conn().await;
        let mut stmt = conn
            .prepare("SELECT user_id FROM device_owners WHERE serial = ?1")
            .context("Preparing owners query")?;
        let users = stmt
            .query_map([serial], |row| row.get::<_, String>(0))
            .context("Querying owners")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Reading owners")?;
        Ok(users)
    }

    /// Whether the serial appears in the user's device set.
    pub async fn user_has_serial(&self, user_id: &str, serial: &str) -> Result<bool> {
        Ok(self.device_set(user_id).await?.contains(serial))
    }

    /// Whether any ownership or share record exists for the serial.
    pub async fn serial_registered(&self, serial: &str) -> Result<bool> {
        let conn = self.db.conn().await;
        let count: i64 = conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM device_owners WHERE serial = ?1) \
                 + (SELECT COUNT(*) FROM device_shares WHERE serial = ?1)",
                [serial],
                |row| row.get(0),
            )
            .context("Querying serial registration")?;
        Ok(count > 0)
    }

    /// Every user with at least one integration row, used at startup.
    pub async fn integration_configs(&self) -> Result<Vec<IntegrationRecord>> {
        let conn = self.db.conn().await;
        let mut stmt = conn
            .prepare("SELECT user_id, type, enabled, config_json FROM integrations")
            .context("Preparing integrations query")?;
        let records = stmt
            .query_map([], |row| {
                Ok(IntegrationRecord {
                    user_id: row.get(0)?,
                    integration_type: row.get(1)?,
                    enabled: row.get::<_, i64>(2)? != 0,
                    config_json: row.get(3)?,
                })
            })
            .context("Querying integrations")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Reading integrations")?;
        Ok(records)
    }
}

/// One row of the `integrations` table, config still unparsed. Each
/// integration type owns its config schema.
#[derive(Debug, Clone)]
pub struct IntegrationRecord {
    pub user_id: UserId,
    pub integration_type: String,
    pub enabled: bool,
    pub config_json: String,
}


#[cfg(test)]
mod tests {
    use super::test_support::{add_owner, add_share};
    use super::*;

    #[tokio::test]
    async fn device_set_unions_owned_and_shared() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        add_owner(&db, "u1", "A").await;
        add_owner(&db, "u1", "B").await;
        add_owner(&db, "u2", "C").await;
        add_share(&db, "u2", "u1", "C").await;

        let users = UserStore::new(db);
        let set = users.device_set("u1").await.unwrap();
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec!["A".to_string(), "B".to_string(), "C".to_string()]
        );
        assert_eq!(
            users.owned_devices("u1").await.unwrap().len(),
            2,
            "shares are not ownership"
        );
        assert!(users.user_has_serial("u1", "C").await.unwrap());
        assert!(!users.user_has_serial("u2", "A").await.unwrap());
    }

    #[tokio::test]
    async fn registration_covers_owners_and_shares() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        add_owner(&db, "u1", "A").await;
        add_share(&db, "u1", "u2", "S").await;

        let users = UserStore::new(db);
        assert!(users.serial_registered("A").await.unwrap());
        assert!(users.serial_registered("S").await.unwrap());
        assert!(!users.serial_registered("Z").await.unwrap());
        assert_eq!(users.owners_of("A").await.unwrap(), vec!["u1"]);
    }
}
