use tracing::debug;

use crate::config::{RoomConfig, ValveBands};

/// Absorbs f32 noise from decimal inputs like `25.0 - 24.7`.
const ERROR_EPSILON_C: f32 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Demand {
    pub call_for_heat: bool,
    pub valve_percent: u8,
}

/// Computes the call-for-heat state and valve band for one room.
///
/// Missing temperature or target holds the previous call-for-heat value;
/// the valve percent then follows the held state rather than an error
/// signal that no longer exists.
pub fn evaluate(
    room: &RoomConfig,
    temperature: Option<f32>,
    target: Option<f32>,
    previous_call_for_heat: bool,
) -> Demand {
    let (Some(temperature), Some(target)) = (temperature, target) else {
        return Demand {
            call_for_heat: previous_call_for_heat,
            valve_percent: if previous_call_for_heat {
                room.bands.max.percent
            } else {
                0
            },
        };
    };

    let error = target - temperature;
    let call_for_heat = if error >= room.hysteresis.on_delta_c - ERROR_EPSILON_C {
        true
    } else if error <= -room.hysteresis.off_delta_c + ERROR_EPSILON_C {
        false
    } else {
        previous_call_for_heat
    };

    if call_for_heat != previous_call_for_heat {
        debug!(
            room = %room.id,
            error,
            call_for_heat,
            "room demand changed"
        );
    }

    Demand {
        call_for_heat,
        valve_percent: if call_for_heat {
            band_percent(&room.bands, error)
        } else {
            0
        },
    }
}

fn band_percent(bands: &ValveBands, error: f32) -> u8 {
    [bands.max, bands.mid, bands.low]
        .into_iter()
        .find(|band| error >= band.error_c - ERROR_EPSILON_C)
        .map(|band| band.percent)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomConfig {
        RoomConfig::new("lounge")
    }

    #[test]
    fn deadband_keeps_demand_until_off_threshold() {
        let room = room();
        let target = Some(25.0);

        let demand = evaluate(&room, Some(24.6), target, false);
        assert!(demand.call_for_heat);

        let mut call = demand.call_for_heat;
        for temp in [24.7, 24.8, 24.9, 24.95, 24.99, 25.0, 25.05, 25.09] {
            call = evaluate(&room, Some(temp), target, call).call_for_heat;
            assert!(call, "demand dropped early at {temp}");
        }

        assert!(!evaluate(&room, Some(25.10), target, call).call_for_heat);
    }

    #[test]
    fn deadband_does_not_start_demand() {
        let room = room();
        let demand = evaluate(&room, Some(24.8), Some(25.0), false);

        assert!(!demand.call_for_heat);
        assert_eq!(demand.valve_percent, 0);
    }

    #[test]
    fn on_threshold_is_inclusive() {
        let demand = evaluate(&room(), Some(24.7), Some(25.0), false);
        assert!(demand.call_for_heat);
    }

    #[test]
    fn highest_met_band_wins() {
        let room = room();

        assert_eq!(evaluate(&room, Some(24.7), Some(25.0), true).valve_percent, 30);
        assert_eq!(evaluate(&room, Some(24.4), Some(25.0), true).valve_percent, 60);
        assert_eq!(evaluate(&room, Some(23.0), Some(25.0), true).valve_percent, 100);
        // Still calling inside the deadband but below the lowest band.
        assert_eq!(evaluate(&room, Some(25.05), Some(25.0), true).valve_percent, 0);
    }

    #[test]
    fn missing_temperature_holds_previous_state() {
        let room = room();

        let held_on = evaluate(&room, None, Some(25.0), true);
        assert_eq!(
            held_on,
            Demand {
                call_for_heat: true,
                valve_percent: 100
            }
        );

        let held_off = evaluate(&room, Some(18.0), None, false);
        assert_eq!(
            held_off,
            Demand {
                call_for_heat: false,
                valve_percent: 0
            }
        );
    }
}
