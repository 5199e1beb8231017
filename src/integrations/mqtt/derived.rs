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

//! Translation between the thermostat's internal object fields and the
//! smart-home hub's climate vocabulary. The raw topics mirror the objects
//! verbatim; everything here is the derived `ha/…` view.

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use strum::{Display, EnumString};

/// Safety bounds applied to hub-side temperature commands when the shared
/// object does not carry its own safety range. Degrees Celsius.
const SAFETY_TEMP_MIN: f64 = 9.0;
const SAFETY_TEMP_MAX: f64 = 32.0;

/// One hour, the fixed runtime of a hub-initiated fan timer.
const FAN_TIMER_RUN_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum HvacMode {
    Off,
    Heat,
    Cool,
    HeatCool,
}

impl HvacMode {
    /// Maps the internal `target_temperature_type` to the hub vocabulary.
    pub fn from_internal(target_temperature_type: &str) -> Option<Self> {
        match target_temperature_type {
            "off" => Some(HvacMode::Off),
            "heat" => Some(HvacMode::Heat),
            "cool" => Some(HvacMode::Cool),
            "range" => Some(HvacMode::HeatCool),
            _ => None,
        }
    }

    pub fn to_internal(self) -> &'static str {
        match self {
            HvacMode::Off => "off",
            HvacMode::Heat => "heat",
            HvacMode::Cool => "cool",
            HvacMode::HeatCool => "range",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum HvacAction {
    Heating,
    Cooling,
    Fan,
    Idle,
    Off,
}

/// The full derived view of one thermostat, computed from its `device` and
/// `shared` objects plus the cached outdoor weather.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedState {
    pub current_temperature: Option<f64>,
    pub current_humidity: Option<f64>,
    pub target_temperature: Option<f64>,
    pub target_temperature_low: Option<f64>,
    pub target_temperature_high: Option<f64>,
    pub mode: HvacMode,
    pub action: HvacAction,
    pub fan_mode: &'static str,
    pub preset: &'static str,
    pub outdoor_temperature: Option<f64>,
    pub occupancy: bool,
    pub fan_running: bool,
    pub eco: bool,
}

pub fn derive_state(
    device: Option<&Value>,
    shared: Option<&Value>,
    outdoor_temperature: Option<f64>,
    now_secs: i64,
) -> DerivedState {
    let null = Value::Null;
    let device = device.unwrap_or(&null);
    let shared = shared.unwrap_or(&null);

    let mode = shared
        .get("target_temperature_type")
        .and_then(Value::as_str)
        .and_then(HvacMode::from_internal)
        .unwrap_or(HvacMode::Off);

    let heater_on = bool_field(shared, "hvac_heater_state");
    let ac_on = bool_field(shared, "hvac_ac_state");
    let fan_on = bool_field(shared, "hvac_fan_state");
    let action = if heater_on {
        HvacAction::Heating
    } else if ac_on {
        HvacAction::Cooling
    } else if fan_on {
        HvacAction::Fan
    } else if mode == HvacMode::Off {
        HvacAction::Off
    } else {
        HvacAction::Idle
    };

    let fan_timer_running = bool_field(device, "fan_control_state")
        && device
            .get("fan_timer_timeout")
            .and_then(Value::as_f64)
            .is_some_and(|timeout| timeout > now_secs as f64);
    let eco = device
        .get("eco")
        .and_then(|eco| eco.get("mode"))
        .and_then(Value::as_str)
        .is_some_and(|mode| mode.contains("eco"));
    let away = bool_field(device, "away")
        || device
            .get("auto_away")
            .and_then(Value::as_i64)
            .is_some_and(|auto_away| auto_away >= 1);
    let preset = if eco {
        "eco"
    } else if away {
        "away"
    } else {
        "home"
    };

    DerivedState {
        current_temperature: float_field(shared, "current_temperature"),
        current_humidity: float_field(device, "current_humidity"),
        target_temperature: float_field(shared, "target_temperature"),
        target_temperature_low: float_field(shared, "target_temperature_low"),
        target_temperature_high: float_field(shared, "target_temperature_high"),
        mode,
        action,
        fan_mode: if fan_timer_running { "on" } else { "auto" },
        preset,
        outdoor_temperature,
        occupancy: !away,
        fan_running: fan_on,
        eco,
    }
}

/// The retained `ha/…` topic payloads for one derived view, relative to
/// `«prefix»/«serial»`.
pub fn state_payloads(state: &DerivedState) -> Vec<(&'static str, String)> {
    let mut payloads = vec![
        ("ha/mode", state.mode.to_string()),
        ("ha/action", state.action.to_string()),
        ("ha/fan_mode", state.fan_mode.to_string()),
        ("ha/preset", state.preset.to_string()),
        ("ha/occupancy", state.occupancy.to_string()),
        ("ha/fan_running", state.fan_running.to_string()),
        ("ha/eco", state.eco.to_string()),
    ];
    let mut push_temp = |topic: &'static str, value: Option<f64>| {
        if let Some(value) = value {
            payloads.push((topic, format!("{value:.1}")));
        }
    };
    push_temp("ha/current_temperature", state.current_temperature);
    push_temp("ha/current_humidity", state.current_humidity);
    push_temp("ha/target_temperature", state.target_temperature);
    push_temp("ha/target_temperature_low", state.target_temperature_low);
    push_temp("ha/target_temperature_high", state.target_temperature_high);
    push_temp("ha/outdoor_temperature", state.outdoor_temperature);
    payloads
}

/// Which object a translated hub command writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Device,
    Shared,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandWrite {
    pub target: WriteTarget,
    pub value: Value,
}

/// Translates one `ha/«command»/set` payload into an object write. The
/// shared object supplies the safety range for temperature commands.
pub fn translate_command(
    command: &str,
    payload: &str,
    shared: Option<&Value>,
    now_secs: i64,
) -> Result<CommandWrite> {
    match command {
        "mode" => {
            let mode: HvacMode = payload
                .parse()
                .map_err(|_| anyhow!("Unknown mode: {payload}"))?;
            Ok(CommandWrite {
                target: WriteTarget::Shared,
                value: json!({ "target_temperature_type": mode.to_internal() }),
            })
        }
        "target_temperature" | "target_temperature_low" | "target_temperature_high" => {
            let temperature: f64 = payload
                .trim()
                .parse()
                .map_err(|_| anyhow!("Unparseable temperature: {payload}"))?;
            let (min, max) = safety_range(shared);
            if !(min..=max).contains(&temperature) {
                return Err(anyhow!(
                    "Temperature {temperature} outside the safety range {min}..{max}"
                ));
            }
            Ok(CommandWrite {
                target: WriteTarget::Shared,
                value: json!({ command: temperature }),
            })
        }
        "fan_mode" => match payload {
            "on" => Ok(CommandWrite {
                target: WriteTarget::Device,
                value: json!({
                    "fan_control_state": true,
                    "fan_timer_active": true,
                    "fan_timer_timeout": now_secs + FAN_TIMER_RUN_SECS,
                }),
            }),
            "off" | "auto" => Ok(CommandWrite {
                target: WriteTarget::Device,
                value: json!({
                    "fan_control_state": false,
                    "fan_timer_active": false,
                    "fan_timer_timeout": 0,
                }),
            }),
            other => Err(anyhow!("Unknown fan mode: {other}")),
        },
        "preset" => match payload {
            "away" => Ok(CommandWrite {
                target: WriteTarget::Device,
                value: json!({ "auto_away": 2, "away": true }),
            }),
            "home" => Ok(CommandWrite {
                target: WriteTarget::Device,
                value: json!({ "auto_away": 0, "away": false }),
            }),
            "eco" => Ok(CommandWrite {
                target: WriteTarget::Device,
                value: json!({ "eco": { "mode": "manual-eco", "leaf": true } }),
            }),
            other => Err(anyhow!("Unknown preset: {other}")),
        },
        other => Err(anyhow!("Unknown command: {other}")),
    }
}

fn safety_range(shared: Option<&Value>) -> (f64, f64) {
    let min = shared
        .and_then(|s| s.get("lower_safety_temp"))
        .and_then(Value::as_f64)
        .unwrap_or(SAFETY_TEMP_MIN);
    let max = shared
        .and_then(|s| s.get("upper_safety_temp"))
        .and_then(Value::as_f64)
        .unwrap_or(SAFETY_TEMP_MAX);
    (min, max)
}

fn bool_field(value: &Value, field: &str) -> bool {
    value.get(field).and_then(Value::as_bool).unwrap_or(false)
}

fn float_field(value: &Value, field: &str) -> Option<f64> {
    value.get(field).and_then(Value::as_f64)
}
