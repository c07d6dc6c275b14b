//! Push messages from the remote and the attribute cache they update

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Attributes of the remote kept current from push messages
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RemoteState {
    pub ambient_light_intensity: Option<f64>,
    pub battery_status: Option<String>,
    pub battery_level: Option<u8>,
    pub is_charging: Option<bool>,
    pub display_auto_brightness: Option<bool>,
    pub display_brightness: Option<u8>,
    pub button_backlight: Option<bool>,
    pub button_backlight_brightness: Option<u8>,
    pub sound_effects: Option<bool>,
    pub sound_effects_volume: Option<u8>,
    pub haptic_feedback: Option<bool>,
    pub display_timeout: Option<u32>,
    pub wakeup_sensitivity: Option<u8>,
    pub sleep_timeout: Option<u32>,
    pub power_mode: Option<String>,
    /// Activity entity id to "ON" / "OFF"
    pub activities: HashMap<String, String>,
}

/// Which part of the cache a message touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteUpdateType {
    AmbientLight,
    Battery,
    Configuration,
    Activity,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatteryStatus {
    pub status: String,
    pub capacity: u8,
    pub power_supply: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DisplaySettings {
    pub auto_brightness: Option<bool>,
    pub brightness: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SoundSettings {
    pub enabled: Option<bool>,
    pub volume: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HapticSettings {
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PowerSavingSettings {
    pub display_off_sec: Option<u32>,
    pub wakeup_sensitivity: Option<u8>,
    pub standby_sec: Option<u32>,
}

/// Sections of a `configuration_change` message; absent sections are left alone
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigurationChange {
    pub display: Option<DisplaySettings>,
    pub button: Option<DisplaySettings>,
    pub sound: Option<SoundSettings>,
    pub haptic: Option<HapticSettings>,
    pub power_saving: Option<PowerSavingSettings>,
}

/// A decoded push message
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteUpdate {
    AmbientLight { intensity: f64 },
    Battery(BatteryStatus),
    Configuration(ConfigurationChange),
    PowerMode(String),
    Activity { entity_id: String, state: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    msg_data: Value,
}

impl RemoteUpdate {
    /// Decode a raw socket message
    ///
    /// Messages the cache does not track, or that are missing fields, yield
    /// `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let envelope: Envelope = serde_json::from_str(text).ok()?;
        let data = envelope.msg_data;

        match envelope.msg.as_deref() {
            Some("ambient_light") => Some(RemoteUpdate::AmbientLight {
                intensity: data.get("intensity")?.as_f64()?,
            }),
            Some("battery_status") => serde_json::from_value(data).ok().map(RemoteUpdate::Battery),
            Some("configuration_change") => {
                let change = serde_json::from_value(data.get("new_state")?.clone()).ok()?;
                Some(RemoteUpdate::Configuration(change))
            }
            Some("power_mode_change") => Some(RemoteUpdate::PowerMode(
                data.get("mode")?.as_str()?.to_string(),
            )),
            _ => Self::parse_activity(&data),
        }
    }

    fn parse_activity(data: &Value) -> Option<Self> {
        if data.get("entity_type")?.as_str()? != "activity" {
            return None;
        }
        let state = data.pointer("/new_state/attributes/state")?.as_str()?;
        if state != "ON" && state != "OFF" {
            return None;
        }
        Some(RemoteUpdate::Activity {
            entity_id: data.get("entity_id")?.as_str()?.to_string(),
            state: state.to_string(),
        })
    }
}

impl RemoteState {
    /// Fold one update into the cache
    pub fn apply(&mut self, update: RemoteUpdate) -> RemoteUpdateType {
        match update {
            RemoteUpdate::AmbientLight { intensity } => {
                self.ambient_light_intensity = Some(intensity);
                RemoteUpdateType::AmbientLight
            }
            RemoteUpdate::Battery(battery) => {
                self.battery_status = Some(battery.status);
                self.battery_level = Some(battery.capacity);
                self.is_charging = Some(battery.power_supply);
                RemoteUpdateType::Battery
            }
            RemoteUpdate::Configuration(change) => {
                if let Some(display) = change.display {
                    self.display_auto_brightness = display.auto_brightness;
                    self.display_brightness = display.brightness;
                }
                if let Some(button) = change.button {
                    self.button_backlight = button.auto_brightness;
                    self.button_backlight_brightness = button.brightness;
                }
                if let Some(sound) = change.sound {
                    self.sound_effects = sound.enabled;
                    self.sound_effects_volume = sound.volume;
                }
                if let Some(haptic) = change.haptic {
                    self.haptic_feedback = haptic.enabled;
                }
                if let Some(power_saving) = change.power_saving {
                    self.display_timeout = power_saving.display_off_sec;
                    self.wakeup_sensitivity = power_saving.wakeup_sensitivity;
                    self.sleep_timeout = power_saving.standby_sec;
                }
                RemoteUpdateType::Configuration
            }
            RemoteUpdate::PowerMode(mode) => {
                self.power_mode = Some(mode);
                RemoteUpdateType::Configuration
            }
            RemoteUpdate::Activity { entity_id, state } => {
                self.activities.insert(entity_id, state);
                RemoteUpdateType::Activity
            }
        }
    }

    pub fn is_activity_on(&self, entity_id: &str) -> bool {
        self.activities.get(entity_id).is_some_and(|s| s == "ON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(state: &mut RemoteState, message: Value) -> Option<RemoteUpdateType> {
        RemoteUpdate::parse(&message.to_string()).map(|u| state.apply(u))
    }

    #[test]
    fn test_battery_status() {
        let mut state = RemoteState::default();
        let kind = apply(
            &mut state,
            json!({"kind": "event", "msg": "battery_status",
                   "msg_data": {"status": "CHARGING", "capacity": 87, "power_supply": true}}),
        );
        assert_eq!(kind, Some(RemoteUpdateType::Battery));
        assert_eq!(state.battery_level, Some(87));
        assert_eq!(state.is_charging, Some(true));
    }

    #[test]
    fn test_configuration_change_touches_present_sections_only() {
        let mut state = RemoteState {
            haptic_feedback: Some(true),
            ..Default::default()
        };
        apply(
            &mut state,
            json!({"msg": "configuration_change", "msg_data": {"new_state": {
                "display": {"auto_brightness": false, "brightness": 40},
                "power_saving": {"display_off_sec": 30, "wakeup_sensitivity": 2, "standby_sec": 600}
            }}}),
        );
        assert_eq!(state.display_brightness, Some(40));
        assert_eq!(state.sleep_timeout, Some(600));
        assert_eq!(state.haptic_feedback, Some(true));
    }

    #[test]
    fn test_activity_on_off() {
        let mut state = RemoteState::default();
        let message = json!({"msg": "entity_change", "msg_data": {
            "entity_type": "activity",
            "entity_id": "uc.main.movie",
            "new_state": {"attributes": {"state": "ON"}}
        }});
        assert_eq!(apply(&mut state, message), Some(RemoteUpdateType::Activity));
        assert!(state.is_activity_on("uc.main.movie"));

        let running = json!({"msg": "entity_change", "msg_data": {
            "entity_type": "activity",
            "entity_id": "uc.main.movie",
            "new_state": {"attributes": {"state": "RUNNING"}}
        }});
        assert_eq!(apply(&mut state, running), None);
    }

    #[test]
    fn test_incomplete_or_unknown_messages_are_ignored() {
        let mut state = RemoteState::default();
        assert_eq!(apply(&mut state, json!({"msg": "ambient_light", "msg_data": {}})), None);
        assert_eq!(apply(&mut state, json!({"msg": "software_update"})), None);
        assert!(RemoteUpdate::parse("not json").is_none());
        assert_eq!(state, RemoteState::default());
    }

    #[test]
    fn test_power_mode() {
        let mut state = RemoteState::default();
        apply(
            &mut state,
            json!({"msg": "power_mode_change", "msg_data": {"mode": "LOW_POWER"}}),
        );
        assert_eq!(state.power_mode.as_deref(), Some("LOW_POWER"));
    }
}
