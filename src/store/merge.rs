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

use serde_json::{Map, Value};

/// The fan-timer fields that partial device writes tend to drop. While a fan
/// timer is running, these are carried over from the previously stored value
/// so that an unrelated partial update does not read as a timer cancellation.
const FAN_TIMER_FIELDS: [&str; 5] = [
    "fan_timer_timeout",
    "fan_control_state",
    "fan_timer_duration",
    "fan_current_speed",
    "fan_mode",
];

/// Recursive per-key merge of two JSON documents.
///
/// Mappings merge key-wise with the incoming side winning on conflicts at the
/// leaves; anything that is not a mapping on either side (scalars, arrays,
/// null) is replaced wholesale by the incoming value. Arrays are never
/// concatenated.
pub fn deep_merge(current: Option<&Value>, incoming: Option<&Value>) -> Value {
    match (current, incoming) {
        (Some(cur), None) => cur.clone(),
        (None, Some(inc)) => inc.clone(),
        (None, None) => Value::Null,
        (Some(cur), Some(inc)) => match (cur, inc) {
            (Value::Object(cur_map), Value::Object(inc_map)) => {
                let mut merged = Map::with_capacity(cur_map.len() + inc_map.len());
                for (key, cur_val) in cur_map {
                    merged.insert(key.clone(), cur_val.clone());
                }
                for (key, inc_val) in inc_map {
                    let merged_val = deep_merge(cur_map.get(key), Some(inc_val));
                    merged.insert(key.clone(), merged_val);
                }
                Value::Object(merged)
            }
            (_, inc) => inc.clone(),
        },
    }
}

/// Whether a stored device value carries a fan timer that has not yet
/// expired: `fan_timer_timeout` must be a non-zero number of epoch seconds
/// strictly in the future.
pub fn has_active_fan_timer(existing: &Value, now_secs: i64) -> bool {
    existing
        .get("fan_timer_timeout")
        .and_then(Value::as_f64)
        .is_some_and(|timeout| timeout != 0.0 && timeout > now_secs as f64)
}

/// Whether an incoming payload explicitly turns the fan off, either by
/// zeroing the timer or by clearing the control state. Explicit off always
/// defeats fan-timer preservation.
pub fn is_explicit_fan_off(incoming: &Value) -> bool {
    let timeout_zeroed = incoming
        .get("fan_timer_timeout")
        .and_then(Value::as_f64)
        .is_some_and(|timeout| timeout == 0.0);
    let control_cleared = incoming
        .get("fan_control_state")
        .and_then(Value::as_bool)
        .is_some_and(|state| !state);
    timeout_zeroed || control_cleared
}

/// Re-injects the fan-timer fields from `existing` over `merged`. Only the
/// five timer fields are overwritten, and only those actually present in the
/// existing value; every other merged field stands.
pub fn preserve_fan_timer(existing: &Value, merged: &mut Value) {
    let Value::Object(merged_map) = merged else {
        return;
    };
    for field in FAN_TIMER_FIELDS {
        if let Some(previous) = existing.get(field) {
            merged_map.insert(field.to_string(), previous.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_with_absent_sides() {
        let value = json!({"a": 1});
        assert_eq!(deep_merge(Some(&value), None), value);
        assert_eq!(deep_merge(None, Some(&value)), value);
        assert_eq!(deep_merge(None, None), Value::Null);
    }

    #[test]
    fn merge_unions_mapping_keys() {
        let current = json!({"a": 1, "b": {"x": 1, "y": 2}});
        let incoming = json!({"b": {"y": 3, "z": 4}, "c": true});
        let merged = deep_merge(Some(&current), Some(&incoming));
        assert_eq!(
            merged,
            json!({"a": 1, "b": {"x": 1, "y": 3, "z": 4}, "c": true})
        );
    }

    #[test]
    fn non_mappings_replace_wholesale() {
        let current = json!({"list": [1, 2, 3], "scalar": 5});
        let incoming = json!({"list": [9], "scalar": {"now": "a map"}});
        let merged = deep_merge(Some(&current), Some(&incoming));
        assert_eq!(merged["list"], json!([9]));
        assert_eq!(merged["scalar"], json!({"now": "a map"}));

        // a scalar incoming replaces an entire mapping
        assert_eq!(
            deep_merge(Some(&json!({"a": 1})), Some(&json!(42))),
            json!(42)
        );
    }

    #[test]
    fn merge_is_a_left_fold() {
        let writes = [
            json!({"a": 1}),
            json!({"b": {"x": 1}}),
            json!({"b": {"y": 2}, "a": 3}),
        ];
        let mut folded = Value::Null;
        for write in &writes {
            folded = deep_merge(Some(&folded), Some(write));
        }
        assert_eq!(folded, json!({"a": 3, "b": {"x": 1, "y": 2}}));
    }

    #[test]
    fn fan_timer_activity() {
        let now = 1_700_000_000;
        assert!(has_active_fan_timer(
            &json!({"fan_timer_timeout": now + 60}),
            now
        ));
        assert!(!has_active_fan_timer(
            &json!({"fan_timer_timeout": now - 60}),
            now
        ));
        assert!(!has_active_fan_timer(&json!({"fan_timer_timeout": 0}), now));
        assert!(!has_active_fan_timer(
            &json!({"fan_timer_timeout": "soon"}),
            now
        ));
        assert!(!has_active_fan_timer(&json!({}), now));
    }

    #[test]
    fn explicit_fan_off_detection() {
        assert!(is_explicit_fan_off(&json!({"fan_timer_timeout": 0})));
        assert!(is_explicit_fan_off(&json!({"fan_control_state": false})));
        assert!(!is_explicit_fan_off(&json!({"fan_control_state": true})));
        assert!(!is_explicit_fan_off(&json!({"temperature": 21})));
        assert!(!is_explicit_fan_off(
            &json!({"fan_timer_timeout": 9_999_999_999_i64})
        ));
    }

    #[test]
    fn preservation_only_touches_timer_fields() {
        let existing = json!({
            "fan_timer_timeout": 9_999_999_999_i64,
            "fan_control_state": true,
            "temperature": 20
        });
        let mut merged = json!({
            "fan_timer_timeout": 0,
            "fan_control_state": false,
            "temperature": 21
        });
        preserve_fan_timer(&existing, &mut merged);
        assert_eq!(merged["fan_timer_timeout"], json!(9_999_999_999_i64));
        assert_eq!(merged["fan_control_state"], json!(true));
        assert_eq!(merged["temperature"], json!(21));
        // fields absent from existing are left alone
        assert!(merged.get("fan_timer_duration").is_none());
    }
}
