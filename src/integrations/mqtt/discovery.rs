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

//! Home Assistant MQTT discovery payloads. One retained config message per
//! entity; an empty retained payload on the same topic removes the entity
//! again.

use serde_json::{json, Value};

/// Entity capabilities that shape the climate discovery schema. Re-published
/// whenever the mode changes so the hub entity follows the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClimateCapabilities {
    pub can_heat: bool,
    pub can_cool: bool,
    pub uses_range: bool,
}

impl Default for ClimateCapabilities {
    fn default() -> Self {
        Self {
            can_heat: true,
            can_cool: true,
            uses_range: false,
        }
    }
}

impl ClimateCapabilities {
    pub fn from_shared(shared: Option<&Value>) -> Self {
        let Some(shared) = shared else {
            return Self::default();
        };
        let flag = |field: &str, default: bool| {
            shared.get(field).and_then(Value::as_bool).unwrap_or(default)
        };
        Self {
            can_heat: flag("can_heat", true),
            can_cool: flag("can_cool", true),
            uses_range: shared
                .get("target_temperature_type")
                .and_then(Value::as_str)
                .is_some_and(|t| t == "range"),
        }
    }
}

fn device_block(serial: &str) -> Value {
    json!({
        "identifiers": [serial],
        "name": format!("Thermostat {serial}"),
        "manufacturer": "Nest",
        "model": "Learning Thermostat",
    })
}

/// The retained climate entity config for one thermostat.
pub fn climate_config(
    prefix: &str,
    discovery_prefix: &str,
    serial: &str,
    caps: ClimateCapabilities,
) -> (String, Value) {
    let base = format!("{prefix}/{serial}/ha");
    let mut modes = vec!["off"];
    if caps.can_heat {
        modes.push("heat");
    }
    if caps.can_cool {
        modes.push("cool");
    }
    if caps.can_heat && caps.can_cool {
        modes.push("heat_cool");
    }

    let mut config = json!({
        "name": format!("Thermostat {serial}"),
        "unique_id": format!("{serial}_climate"),
        "device": device_block(serial),
        "modes": modes,
        "mode_state_topic": format!("{base}/mode"),
        "mode_command_topic": format!("{base}/mode/set"),
        "action_topic": format!("{base}/action"),
        "current_temperature_topic": format!("{base}/current_temperature"),
        "current_humidity_topic": format!("{base}/current_humidity"),
        "fan_modes": ["auto", "on"],
        "fan_mode_state_topic": format!("{base}/fan_mode"),
        "fan_mode_command_topic": format!("{base}/fan_mode/set"),
        "preset_modes": ["home", "away", "eco"],
        "preset_mode_state_topic": format!("{base}/preset"),
        "preset_mode_command_topic": format!("{base}/preset/set"),
        "availability_topic": format!("{prefix}/{serial}/availability"),
        "payload_available": "online",
        "payload_not_available": "offline",
        "temperature_unit": "C",
        "temp_step": 0.5,
        "min_temp": 9,
        "max_temp": 32,
    });
    let entries = config.as_object_mut().expect("climate config is a map");
    if caps.uses_range {
        entries.insert(
            "temperature_low_state_topic".into(),
            json!(format!("{base}/target_temperature_low")),
        );
        entries.insert(
            "temperature_low_command_topic".into(),
            json!(format!("{base}/target_temperature_low/set")),
        );
        entries.insert(
            "temperature_high_state_topic".into(),
            json!(format!("{base}/target_temperature_high")),
        );
        entries.insert(
            "temperature_high_command_topic".into(),
            json!(format!("{base}/target_temperature_high/set")),
        );
    } else {
        entries.insert(
            "temperature_state_topic".into(),
            json!(format!("{base}/target_temperature")),
        );
        entries.insert(
            "temperature_command_topic".into(),
            json!(format!("{base}/target_temperature/set")),
        );
    }

    (
        format!("{discovery_prefix}/climate/{serial}/config"),
        config,
    )
}

/// Auxiliary sensor entities published next to the climate entity.
pub fn sensor_configs(prefix: &str, discovery_prefix: &str, serial: &str) -> Vec<(String, Value)> {
    let base = format!("{prefix}/{serial}/ha");
    let availability = format!("{prefix}/{serial}/availability");
    let sensor = |slug: &str, name: &str, class: &str, unit: Option<&str>| {
        let mut config = json!({
            "name": format!("Thermostat {serial} {name}"),
            "unique_id": format!("{serial}_{slug}"),
            "device": device_block(serial),
            "state_topic": format!("{base}/{slug}"),
            "device_class": class,
            "availability_topic": availability,
        });
        if let Some(unit) = unit {
            config
                .as_object_mut()
                .expect("sensor config is a map")
                .insert("unit_of_measurement".into(), json!(unit));
        }
        config
    };

    vec![
        (
            format!("{discovery_prefix}/sensor/{serial}/current_temperature/config"),
            sensor("current_temperature", "Temperature", "temperature", Some("°C")),
        ),
        (
            format!("{discovery_prefix}/sensor/{serial}/current_humidity/config"),
            sensor("current_humidity", "Humidity", "humidity", Some("%")),
        ),
        (
            format!("{discovery_prefix}/sensor/{serial}/outdoor_temperature/config"),
            sensor(
                "outdoor_temperature",
                "Outdoor Temperature",
                "temperature",
                Some("°C"),
            ),
        ),
        (
            format!("{discovery_prefix}/binary_sensor/{serial}/occupancy/config"),
            json!({
                "name": format!("Thermostat {serial} Occupancy"),
                "unique_id": format!("{serial}_occupancy"),
                "device": device_block(serial),
                "state_topic": format!("{base}/occupancy"),
                "device_class": "occupancy",
                "payload_on": "true",
                "payload_off": "false",
                "availability_topic": availability,
            }),
        ),
    ]
}

/// Every discovery topic for a serial, used for tombstoning a removed
/// device with empty retained payloads.
pub fn discovery_topics(prefix: &str, discovery_prefix: &str, serial: &str) -> Vec<String> {
    let mut topics = vec![format!("{discovery_prefix}/climate/{serial}/config")];
    topics.extend(
        sensor_configs(prefix, discovery_prefix, serial)
            .into_iter()
            .map(|(topic, _)| topic),
    );
    topics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn climate_config_points_at_the_derived_topics() {
        let (topic, config) =
            climate_config("nest", "homeassistant", "C", ClimateCapabilities::default());
        assert_eq!(topic, "homeassistant/climate/C/config");
        assert_eq!(config["mode_command_topic"], json!("nest/C/ha/mode/set"));
        assert_eq!(
            config["temperature_command_topic"],
            json!("nest/C/ha/target_temperature/set")
        );
        assert_eq!(config["availability_topic"], json!("nest/C/availability"));
        assert_eq!(config["modes"], json!(["off", "heat", "cool", "heat_cool"]));
        assert_eq!(config["temperature_unit"], json!("C"));
        assert!(config.get("temperature_low_command_topic").is_none());
    }

    #[test]
    fn range_mode_swaps_the_temperature_schema() {
        let caps = ClimateCapabilities {
            uses_range: true,
            ..Default::default()
        };
        let (_, config) = climate_config("nest", "homeassistant", "C", caps);
        assert!(config.get("temperature_command_topic").is_none());
        assert_eq!(
            config["temperature_low_command_topic"],
            json!("nest/C/ha/target_temperature_low/set")
        );
        assert_eq!(
            config["temperature_high_state_topic"],
            json!("nest/C/ha/target_temperature_high")
        );
    }

    #[test]
    fn heat_only_devices_lose_the_cool_modes() {
        let caps = ClimateCapabilities {
            can_heat: true,
            can_cool: false,
            uses_range: false,
        };
        let (_, config) = climate_config("nest", "homeassistant", "C", caps);
        assert_eq!(config["modes"], json!(["off", "heat"]));
    }

    #[test]
    fn capabilities_follow_the_shared_object() {
        let shared = json!({"can_heat": true, "can_cool": false, "target_temperature_type": "range"});
        let caps = ClimateCapabilities::from_shared(Some(&shared));
        assert!(caps.can_heat);
        assert!(!caps.can_cool);
        assert!(caps.uses_range);
        assert_eq!(
            ClimateCapabilities::from_shared(None),
            ClimateCapabilities::default()
        );
    }

    #[test]
    fn tombstones_cover_every_published_config() {
        let topics = discovery_topics("nest", "homeassistant", "C");
        assert!(topics.contains(&"homeassistant/climate/C/config".to_string()));
        assert!(topics.contains(&"homeassistant/sensor/C/current_humidity/config".to_string()));
        assert!(topics.contains(&"homeassistant/binary_sensor/C/occupancy/config".to_string()));
        assert_eq!(topics.len(), 5);
    }
}
