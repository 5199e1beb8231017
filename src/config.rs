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

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use toml_edit::DocumentMut;

use crate::users::AuthPolicy;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/hearthd";
pub const CONFIG_DIR_ENV: &str = "HEARTHD_CONFIG_DIR";
const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_CONFIG_FILE_BYTES: &[u8] = include_bytes!("../resources/config-default.toml");

/// All daemon settings, parsed once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub address: Option<String>,
    pub port: u16,
    pub transport_url: Option<String>,
    pub weather_url: Option<String>,
    pub auth_policy: AuthPolicy,
    pub availability_timeout: Duration,
    pub availability_check_interval: Duration,
    pub long_poll_timeout: Duration,
    pub default_broker_url: Option<String>,
    pub mqtt_connect_timeout: Duration,
    pub mqtt_reconnect_period: Duration,
    pub device_list_reconcile_interval: Duration,
    pub weather_cache_ttl: Duration,
}

pub struct Config {
    path: PathBuf,
    document: DocumentMut,
}

impl Config {
    /// Loads the configuration file, creating it from the embedded defaults
    /// when missing or empty, and verifies that all settings parse.
    pub async fn load_config_file(config_dir: Option<&Path>) -> Result<Self> {
        let dir = match config_dir {
            Some(dir) => dir.to_path_buf(),
            None => std::env::var(CONFIG_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR)),
        };
        if !dir.exists() {
            info!(
                "Config directory doesn't exist. Attempting to create it: {}",
                dir.display()
            );
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Creating config directory {}", dir.display()))?;
        }
        let path = dir.join(CONFIG_FILE_NAME);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if !contents.trim().is_empty() => contents,
            Ok(_) => {
                warn!("Config file is empty. Creating a new config file.");
                Self::create_new_config_file(&path).await?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("Config file not found. Creating a new config file.");
                Self::create_new_config_file(&path).await?
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Reading config file {path:?}"));
            }
        };
        let document = contents
            .parse::<DocumentMut>()
            .with_context(|| "Parsing configuration file")?;
        let config = Self { path, document };
        // parse everything once so startup fails loudly on bad settings
        let _ = config.settings()?;
        info!("Configuration file check successful");
        Ok(config)
    }

    async fn create_new_config_file(path: &Path) -> Result<String> {
        info!("Writing new configuration file");
        tokio::fs::write(path, DEFAULT_CONFIG_FILE_BYTES)
            .await
            .with_context(|| format!("Writing new configuration file {path:?}"))?;
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Reading configuration file {path:?}"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> Result<Settings> {
        let db_path = self.get_str("database")?.map_or_else(
            || PathBuf::from("/var/lib/hearthd/hearthd.db"),
            PathBuf::from,
        );
        let auth_policy = match self.get_str("auth_policy")? {
            Some(policy) => AuthPolicy::from_str(&policy)
                .map_err(|_| anyhow!("Unknown auth_policy: {policy}"))?,
            None => AuthPolicy::Open,
        };
        Ok(Settings {
            db_path,
            address: self.get_str("address")?,
            port: u16::try_from(self.get_int("port")?.unwrap_or(3000))
                .map_err(|_| anyhow!("Invalid port"))?,
            transport_url: self.get_str("transport_url")?,
            weather_url: self.get_str("weather_url")?,
            auth_policy,
            availability_timeout: self.get_millis("availability_timeout_ms", 300_000)?,
            availability_check_interval: self
                .get_millis("availability_check_interval_ms", 30_000)?,
            long_poll_timeout: self.get_millis("long_poll_timeout_ms", 60_000)?,
            default_broker_url: self.get_str("default_broker_url")?,
            mqtt_connect_timeout: self.get_millis("mqtt_connect_timeout_ms", 10_000)?,
            mqtt_reconnect_period: self.get_millis("mqtt_reconnect_period_ms", 5_000)?,
            device_list_reconcile_interval: self
                .get_millis("device_list_reconcile_interval_ms", 10_000)?,
            weather_cache_ttl: self.get_millis("weather_cache_ttl_ms", 1_800_000)?,
        })
    }

    fn settings_table(&self) -> Option<&toml_edit::Item> {
        self.document.get("settings")
    }

    fn get_str(&self, name: &str) -> Result<Option<String>> {
        match self.settings_table().and_then(|table| table.get(name)) {
            None => Ok(None),
            Some(item) => item
                .as_str()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| anyhow!("Setting {name} must be a string")),
        }
    }

    fn get_int(&self, name: &str) -> Result<Option<i64>> {
        match self.settings_table().and_then(|table| table.get(name)) {
            None => Ok(None),
            Some(item) => item
                .as_integer()
                .map(Some)
                .ok_or_else(|| anyhow!("Setting {name} must be an integer")),
        }
    }

    fn get_millis(&self, name: &str, default_ms: u64) -> Result<Duration> {
        let millis = match self.get_int(name)? {
            Some(ms) if ms > 0 => ms as u64,
            Some(ms) => return Err(anyhow!("Setting {name} must be positive, got {ms}")),
            None => default_ms,
        };
        Ok(Duration::from_millis(millis))
    }
}
