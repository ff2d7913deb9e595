pub mod boiler;
pub mod config;
pub mod coordinator;
pub mod demand;
pub mod persistence;
pub mod timers;
pub mod topics;
pub mod types;
pub mod valve;

pub use boiler::{BoilerAction, BoilerInput, BoilerStateMachine};
pub use config::{
    BoilerConfig, ConfigError, HeatingConfig, HysteresisConfig, RoomConfig, ValveBand, ValveBands,
    ValveConfig,
};
pub use coordinator::Coordinator;
pub use demand::Demand;
pub use persistence::ValvePersistenceStore;
pub use timers::{AntiCyclingTimers, TimerKind};
pub use topics::*;
pub use types::{
    Actuation, BoilerState, GuardHold, HeatingStatus, RoomId, RoomInput, RoomStatus,
    TransitionRecord,
};
pub use valve::{CommandOutcome, ValveActuator, ValveCommand};
