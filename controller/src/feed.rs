use std::collections::BTreeMap;

use heating_common::{HeatingConfig, RoomInput};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("not a number: {0:?}")]
    NotNumeric(String),
    #[error("temperature {0} out of range")]
    TemperatureOutOfRange(f32),
    #[error("valve position {0} out of range")]
    PercentOutOfRange(f32),
}

const TEMPERATURE_RANGE_C: std::ops::RangeInclusive<f32> = -40.0..=100.0;

/// Returns `Ok(None)` for payloads that withdraw the value.
fn parse_number(payload: &str) -> Result<Option<f32>, PayloadError> {
    let trimmed = payload.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("unavailable")
        || trimmed.eq_ignore_ascii_case("unknown")
    {
        return Ok(None);
    }

    match trimmed.parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(PayloadError::NotNumeric(trimmed.to_string())),
    }
}

pub fn parse_temperature(payload: &str) -> Result<Option<f32>, PayloadError> {
    match parse_number(payload)? {
        Some(value) if !TEMPERATURE_RANGE_C.contains(&value) => {
            Err(PayloadError::TemperatureOutOfRange(value))
        }
        value => Ok(value),
    }
}

pub fn parse_percent(payload: &str) -> Result<Option<u8>, PayloadError> {
    match parse_number(payload)? {
        Some(value) if (0.0..=100.0).contains(&value) => Ok(Some(value.round() as u8)),
        Some(value) => Err(PayloadError::PercentOutOfRange(value)),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Default)]
struct RoomFeed {
    temperature: Option<f32>,
    temperature_ms: Option<u64>,
    target: Option<f32>,
}

/// Latest readings per room as received from the bus, with staleness
/// derived from the age of the last temperature.
#[derive(Debug, Clone)]
pub struct SensorFeeds {
    stale_timeout_ms: u64,
    rooms: BTreeMap<String, RoomFeed>,
}

impl SensorFeeds {
    pub fn new(config: &HeatingConfig) -> Self {
        Self {
            stale_timeout_ms: config.sensor_stale_timeout_s.saturating_mul(1_000),
            rooms: config
                .rooms
                .iter()
                .map(|room| (room.id.clone(), RoomFeed::default()))
                .collect(),
        }
    }

    pub fn knows(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn set_temperature(&mut self, room_id: &str, value: Option<f32>, now_ms: u64) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        room.temperature = value;
        room.temperature_ms = value.map(|_| now_ms);
        true
    }

    pub fn set_target(&mut self, room_id: &str, value: Option<f32>) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        room.target = value;
        true
    }

    pub fn inputs(&self, now_ms: u64) -> impl Iterator<Item = (&str, RoomInput)> + '_ {
        self.rooms
            .iter()
            .map(move |(room_id, room)| (room_id.as_str(), self.room_input(room, now_ms)))
    }

    fn room_input(&self, room: &RoomFeed, now_ms: u64) -> RoomInput {
        let is_stale = match room.temperature_ms {
            Some(at_ms) => now_ms.saturating_sub(at_ms) > self.stale_timeout_ms,
            None => false,
        };
        RoomInput {
            temperature: room.temperature,
            target: room.target,
            is_stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use heating_common::RoomConfig;
    use pretty_assertions::assert_eq;

    use super::*;

    fn feeds() -> SensorFeeds {
        let config = HeatingConfig {
            rooms: vec![RoomConfig::new("hall"), RoomConfig::new("study")],
            sensor_stale_timeout_s: 60,
            ..HeatingConfig::default()
        };
        SensorFeeds::new(&config)
    }

    fn input(feeds: &SensorFeeds, room_id: &str, now_ms: u64) -> Option<RoomInput> {
        feeds
            .inputs(now_ms)
            .find(|(id, _)| *id == room_id)
            .map(|(_, input)| input)
    }

    #[test]
    fn withdrawn_payloads_clear_the_value() {
        assert_eq!(parse_temperature(""), Ok(None));
        assert_eq!(parse_temperature("unavailable"), Ok(None));
        assert_eq!(parse_percent(" Unknown "), Ok(None));
    }

    #[test]
    fn rejects_garbage_and_out_of_range() {
        assert_eq!(parse_temperature("21.5"), Ok(Some(21.5)));
        assert!(matches!(
            parse_temperature("warm"),
            Err(PayloadError::NotNumeric(_))
        ));
        assert!(matches!(
            parse_temperature("NaN"),
            Err(PayloadError::NotNumeric(_))
        ));
        assert_eq!(
            parse_temperature("180"),
            Err(PayloadError::TemperatureOutOfRange(180.0))
        );
        assert_eq!(
            parse_percent("101"),
            Err(PayloadError::PercentOutOfRange(101.0))
        );
    }

    #[test]
    fn percent_rounds_to_whole_steps() {
        assert_eq!(parse_percent("59.6"), Ok(Some(60)));
        assert_eq!(parse_percent("0"), Ok(Some(0)));
    }

    #[test]
    fn temperature_goes_stale_after_timeout() {
        let mut feeds = feeds();
        assert!(feeds.set_temperature("hall", Some(19.0), 1_000));
        assert!(feeds.set_target("hall", Some(21.0)));

        let fresh = input(&feeds, "hall", 61_000).unwrap();
        assert!(!fresh.is_stale);
        assert_eq!(fresh.temperature, Some(19.0));

        let stale = input(&feeds, "hall", 61_001).unwrap();
        assert!(stale.is_stale);
        assert_eq!(stale.target, Some(21.0));

        feeds.set_temperature("hall", Some(19.5), 61_500);
        assert!(!input(&feeds, "hall", 62_000).unwrap().is_stale);
    }

    #[test]
    fn missing_temperature_is_not_stale() {
        let feeds = feeds();
        let inputs: Vec<_> = feeds.inputs(10_000_000).collect();

        assert_eq!(
            inputs,
            vec![("hall", RoomInput::default()), ("study", RoomInput::default())]
        );
    }

    #[test]
    fn unknown_rooms_are_rejected() {
        let mut feeds = feeds();
        assert!(!feeds.knows("garage"));
        assert!(!feeds.set_temperature("garage", Some(10.0), 0));
        assert!(!feeds.set_target("garage", None));
        assert_eq!(input(&feeds, "garage", 0), None);
    }
}
