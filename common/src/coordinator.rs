use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::{
    boiler::{BoilerAction, BoilerInput, BoilerStateMachine},
    config::HeatingConfig,
    demand,
    types::{Actuation, HeatingStatus, RoomId, RoomInput, RoomStatus},
    valve::ValveActuator,
};

#[derive(Debug, Clone, Default)]
struct Room {
    input: RoomInput,
    call_for_heat: bool,
    valve_percent: u8,
}

/// Single owner of all controller state. Every recompute goes through
/// `&mut self`, so cycles cannot interleave.
#[derive(Debug, Clone)]
pub struct Coordinator {
    config: HeatingConfig,
    rooms: BTreeMap<RoomId, Room>,
    boiler: BoilerStateMachine,
    valves: ValveActuator,
    boiler_output: Option<bool>,
}

impl Coordinator {
    pub fn new(config: HeatingConfig) -> Self {
        let boiler = BoilerStateMachine::new(config.boiler.clone());
        Self::with_boiler(config, boiler)
    }

    pub fn after_restart(config: HeatingConfig, now_ms: u64) -> Self {
        let boiler = BoilerStateMachine::after_restart(config.boiler.clone(), now_ms);
        Self::with_boiler(config, boiler)
    }

    fn with_boiler(config: HeatingConfig, boiler: BoilerStateMachine) -> Self {
        let rooms = config
            .rooms
            .iter()
            .map(|room| (room.id.clone(), Room::default()))
            .collect();
        let valves = ValveActuator::new(
            config.valves.clone(),
            config.rooms.iter().map(|room| room.id.clone()),
        );

        Self {
            config,
            rooms,
            boiler,
            valves,
            boiler_output: None,
        }
    }

    pub fn config(&self) -> &HeatingConfig {
        &self.config
    }

    pub fn boiler(&self) -> &BoilerStateMachine {
        &self.boiler
    }

    pub fn valves(&self) -> &ValveActuator {
        &self.valves
    }

    pub fn is_valve_persistence_active(&self) -> bool {
        self.boiler.is_valve_persistence_active()
    }

    pub fn call_for_heat(&self, room_id: &str) -> Option<bool> {
        self.rooms.get(room_id).map(|room| room.call_for_heat)
    }

    pub fn update_room_input(&mut self, room_id: &str, input: RoomInput) -> bool {
        match self.rooms.get_mut(room_id) {
            Some(room) => {
                room.input = input;
                true
            }
            None => {
                warn!(room = room_id, "input for unknown room ignored");
                false
            }
        }
    }

    pub fn record_valve_feedback(&mut self, room_id: &str, percent: Option<u8>) {
        self.valves.record_feedback(room_id, percent);
    }

    /// Runs one control cycle and returns the actuations to dispatch.
    pub fn recompute(&mut self, now_ms: u64) -> Vec<Actuation> {
        let mut actions = Vec::new();

        self.valves
            .poll(now_ms, self.boiler.is_valve_persistence_active(), &mut actions);

        for room_config in &self.config.rooms {
            let Some(room) = self.rooms.get_mut(&room_config.id) else {
                continue;
            };
            let temperature = if room.input.is_stale {
                None
            } else {
                room.input.temperature
            };
            let demand = demand::evaluate(
                room_config,
                temperature,
                room.input.target,
                room.call_for_heat,
            );
            room.call_for_heat = demand.call_for_heat;
            room.valve_percent = demand.valve_percent;
        }

        let calling = || self.rooms.iter().filter(|(_, room)| room.call_for_heat);
        let valves_in_force = self.valves.commanded_percents();
        let input = BoilerInput {
            demand: calling().next().is_some(),
            requested_open_percent: calling()
                .map(|(_, room)| u32::from(room.valve_percent))
                .sum(),
            confirmed_open_percent: calling()
                .map(|(room_id, _)| u32::from(self.valves.confirmed(room_id).unwrap_or(0)))
                .sum(),
            valves_in_force: &valves_in_force,
        };

        for action in self.boiler.update(&input, now_ms) {
            match action {
                BoilerAction::SetBoiler { on } => self.command_boiler(on, &mut actions),
                other => debug!(action = ?other, "boiler action"),
            }
        }
        if self.boiler_output.is_none() {
            self.command_boiler(self.boiler.is_boiler_on(), &mut actions);
        }

        let protective = self.boiler.is_valve_persistence_active();
        let persisted = self.boiler.persisted_valves();
        for (room_id, room) in &self.rooms {
            let target = persisted.get(room_id).unwrap_or(room.valve_percent);
            self.valves
                .set(room_id, target, now_ms, protective, &mut actions);
        }

        actions
    }

    /// Earliest instant at which a recompute could change anything.
    pub fn next_wake_ms(&self, now_ms: u64) -> Option<u64> {
        [self.boiler.next_wake_ms(now_ms), self.valves.next_wake_ms()]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn status(&self, now_ms: u64) -> HeatingStatus {
        let rooms = self
            .rooms
            .iter()
            .map(|(room_id, room)| RoomStatus {
                room_id: room_id.clone(),
                temperature: room.input.temperature,
                target: room.input.target,
                call_for_heat: room.call_for_heat,
                valve_percent: room.valve_percent,
                commanded_percent: self.valves.last_commanded(room_id),
                confirmed_percent: self.valves.confirmed(room_id),
                awaiting_feedback: self
                    .valves
                    .in_flight(room_id)
                    .map(|command| command.awaiting_feedback)
                    .unwrap_or(false),
                command_failed: self.valves.is_failed(room_id),
            })
            .collect();

        HeatingStatus {
            boiler_state: self.boiler.state().as_str(),
            boiler_on: self.boiler.is_boiler_on(),
            persistence_active: self.boiler.is_valve_persistence_active(),
            hold: self.boiler.hold().map(|hold| hold.as_str()),
            rooms,
            timers: self
                .boiler
                .timers()
                .running(now_ms)
                .map(|(kind, remaining_ms)| (kind.as_str(), remaining_ms.div_ceil(1_000)))
                .collect(),
            persisted_valves: self.boiler.persisted_valves().snapshot().clone(),
            recent_transitions: self.boiler.history().cloned().collect(),
        }
    }

    fn command_boiler(&mut self, on: bool, actions: &mut Vec<Actuation>) {
        if self.boiler_output == Some(on) {
            return;
        }
        self.boiler_output = Some(on);
        actions.push(Actuation::SetBoiler { on });
    }
}
