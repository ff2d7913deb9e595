use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type RoomId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoilerState {
    Off,
    PendingOn,
    On,
    PendingOff,
    PumpOverrun,
    InterlockBlocked,
}

impl BoilerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::PendingOn => "PENDING_ON",
            Self::On => "ON",
            Self::PendingOff => "PENDING_OFF",
            Self::PumpOverrun => "PUMP_OVERRUN",
            Self::InterlockBlocked => "INTERLOCK_BLOCKED",
        }
    }

    /// Burner output for this state. The burner keeps firing through the
    /// off-delay and only stops on entry to pump overrun.
    pub fn is_firing(self) -> bool {
        matches!(self, Self::On | Self::PendingOff)
    }

    pub fn persists_valves(self) -> bool {
        matches!(self, Self::PendingOff | Self::PumpOverrun)
    }
}

/// A transition the FSM wanted to take but withheld because a guard has
/// not cleared yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardHold {
    WaitingForMinOff,
    WaitingForMinOn,
    WaitingForValves,
}

impl GuardHold {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitingForMinOff => "WAITING_FOR_MIN_OFF",
            Self::WaitingForMinOn => "WAITING_FOR_MIN_ON",
            Self::WaitingForValves => "WAITING_FOR_VALVES",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::WaitingForMinOff => "waiting for anti-cycling protection",
            Self::WaitingForMinOn => "waiting for minimum on time",
            Self::WaitingForValves => "waiting for valves to confirm open",
        }
    }
}

/// Per-room reading supplied once per cycle by the sensor/schedule side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomInput {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub target: Option<f32>,
    #[serde(rename = "isStale", default)]
    pub is_stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomStatus {
    #[serde(rename = "roomId")]
    pub room_id: RoomId,
    pub temperature: Option<f32>,
    pub target: Option<f32>,
    #[serde(rename = "callForHeat")]
    pub call_for_heat: bool,
    #[serde(rename = "valvePercent")]
    pub valve_percent: u8,
    #[serde(rename = "commandedPercent")]
    pub commanded_percent: Option<u8>,
    #[serde(rename = "confirmedPercent")]
    pub confirmed_percent: Option<u8>,
    #[serde(rename = "awaitingFeedback")]
    pub awaiting_feedback: bool,
    #[serde(rename = "commandFailed")]
    pub command_failed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    #[serde(rename = "atMs")]
    pub at_ms: u64,
    pub from: &'static str,
    pub to: &'static str,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatingStatus {
    #[serde(rename = "boilerState")]
    pub boiler_state: &'static str,
    #[serde(rename = "boilerOn")]
    pub boiler_on: bool,
    #[serde(rename = "persistenceActive")]
    pub persistence_active: bool,
    pub hold: Option<&'static str>,
    pub rooms: Vec<RoomStatus>,
    /// Remaining seconds per armed timer, rounded up.
    pub timers: BTreeMap<&'static str, u64>,
    #[serde(rename = "persistedValves")]
    pub persisted_valves: BTreeMap<RoomId, u8>,
    #[serde(rename = "recentTransitions")]
    pub recent_transitions: Vec<TransitionRecord>,
}

/// Side effect requested from the hardware/platform adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actuation {
    CommandValve { room_id: RoomId, percent: u8 },
    SetBoiler { on: bool },
}
