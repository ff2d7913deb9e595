use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("at least one room must be configured")]
    NoRooms,
    #[error("room id cannot be empty")]
    EmptyRoomId,
    #[error("duplicate room id '{0}'")]
    DuplicateRoom(String),
    #[error("room '{room}': {reason}")]
    InvalidRoom { room: String, reason: &'static str },
    #[error("boiler: {0}")]
    InvalidBoiler(&'static str),
    #[error("valves: {0}")]
    InvalidValves(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoilerConfig {
    pub min_on_time_s: u64,
    pub min_off_time_s: u64,
    pub off_delay_s: u64,
    pub pump_overrun_s: u64,
    pub min_valve_open_percent: u32,
}

impl Default for BoilerConfig {
    fn default() -> Self {
        Self {
            min_on_time_s: 300,
            min_off_time_s: 300,
            off_delay_s: 30,
            pump_overrun_s: 180,
            min_valve_open_percent: 100,
        }
    }
}

impl BoilerConfig {
    pub fn min_on_ms(&self) -> u64 {
        self.min_on_time_s.saturating_mul(1_000)
    }

    pub fn min_off_ms(&self) -> u64 {
        self.min_off_time_s.saturating_mul(1_000)
    }

    pub fn off_delay_ms(&self) -> u64 {
        self.off_delay_s.saturating_mul(1_000)
    }

    pub fn pump_overrun_ms(&self) -> u64 {
        self.pump_overrun_s.saturating_mul(1_000)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValveConfig {
    pub min_interval_s: u64,
    pub confirm_delay_s: u64,
    pub max_attempts: u8,
    pub feedback_tolerance_percent: u8,
}

impl Default for ValveConfig {
    fn default() -> Self {
        Self {
            min_interval_s: 30,
            confirm_delay_s: 2,
            max_attempts: 3,
            feedback_tolerance_percent: 2,
        }
    }
}

impl ValveConfig {
    pub fn min_interval_ms(&self) -> u64 {
        self.min_interval_s.saturating_mul(1_000)
    }

    pub fn confirm_delay_ms(&self) -> u64 {
        self.confirm_delay_s.saturating_mul(1_000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HysteresisConfig {
    pub on_delta_c: f32,
    pub off_delta_c: f32,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            on_delta_c: 0.30,
            off_delta_c: 0.10,
        }
    }
}

/// One step of the valve opening curve: open to `percent` once the
/// temperature error reaches `error_c`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValveBand {
    pub error_c: f32,
    pub percent: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValveBands {
    pub low: ValveBand,
    pub mid: ValveBand,
    pub max: ValveBand,
}

impl Default for ValveBands {
    fn default() -> Self {
        Self {
            low: ValveBand {
                error_c: 0.0,
                percent: 30,
            },
            mid: ValveBand {
                error_c: 0.5,
                percent: 60,
            },
            max: ValveBand {
                error_c: 1.0,
                percent: 100,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub id: String,
    #[serde(default)]
    pub hysteresis: HysteresisConfig,
    #[serde(default)]
    pub bands: ValveBands,
}

impl RoomConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hysteresis: HysteresisConfig::default(),
            bands: ValveBands::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatingConfig {
    pub boiler: BoilerConfig,
    pub valves: ValveConfig,
    pub rooms: Vec<RoomConfig>,
    pub sensor_stale_timeout_s: u64,
    pub state_publish_interval_s: u64,
}

impl Default for HeatingConfig {
    fn default() -> Self {
        Self {
            boiler: BoilerConfig::default(),
            valves: ValveConfig::default(),
            rooms: vec![RoomConfig::new("living_room")],
            sensor_stale_timeout_s: 900,
            state_publish_interval_s: 10,
        }
    }
}

impl HeatingConfig {
    pub fn room(&self, room_id: &str) -> Option<&RoomConfig> {
        self.rooms.iter().find(|room| room.id == room_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rooms.is_empty() {
            return Err(ConfigError::NoRooms);
        }

        let mut seen = HashSet::new();
        for room in &self.rooms {
            if room.id.trim().is_empty() {
                return Err(ConfigError::EmptyRoomId);
            }
            if !seen.insert(room.id.as_str()) {
                return Err(ConfigError::DuplicateRoom(room.id.clone()));
            }
            room.validate()?;
        }

        let max_open = 100 * self.rooms.len() as u32;
        if !(1..=max_open).contains(&self.boiler.min_valve_open_percent) {
            return Err(ConfigError::InvalidBoiler(
                "min_valve_open_percent must be reachable by the configured rooms",
            ));
        }

        if self.valves.confirm_delay_s == 0 {
            return Err(ConfigError::InvalidValves(
                "confirm_delay_s must be at least 1",
            ));
        }
        if self.valves.max_attempts == 0 {
            return Err(ConfigError::InvalidValves("max_attempts must be at least 1"));
        }
        if self.valves.feedback_tolerance_percent > 100 {
            return Err(ConfigError::InvalidValves(
                "feedback_tolerance_percent must be at most 100",
            ));
        }

        Ok(())
    }
}

impl RoomConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &'static str| ConfigError::InvalidRoom {
            room: self.id.clone(),
            reason,
        };

        let HysteresisConfig {
            on_delta_c,
            off_delta_c,
        } = self.hysteresis;
        if !on_delta_c.is_finite() || on_delta_c <= 0.0 {
            return Err(invalid("on_delta_c must be a positive number"));
        }
        if !off_delta_c.is_finite() || off_delta_c < 0.0 {
            return Err(invalid("off_delta_c must be zero or positive"));
        }

        let bands = [self.bands.low, self.bands.mid, self.bands.max];
        if bands
            .iter()
            .any(|band| !band.error_c.is_finite() || band.percent > 100)
        {
            return Err(invalid("valve band percent must be 0-100"));
        }
        if bands.windows(2).any(|pair| pair[0].error_c > pair[1].error_c) {
            return Err(invalid("valve band thresholds must not decrease"));
        }

        Ok(())
    }
}
