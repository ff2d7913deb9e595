use std::collections::{BTreeMap, VecDeque};

use tracing::info;

use crate::{
    config::BoilerConfig,
    persistence::ValvePersistenceStore,
    timers::{AntiCyclingTimers, TimerKind},
    types::{BoilerState, GuardHold, RoomId, TransitionRecord},
};

const HISTORY_LEN: usize = 16;
// Longest legal chain is InterlockBlocked -> PendingOn -> On.
const MAX_STEPS_PER_UPDATE: usize = 4;

/// Aggregate view of the rooms for one update.
#[derive(Debug, Clone, Copy)]
pub struct BoilerInput<'a> {
    /// Any room calling for heat.
    pub demand: bool,
    /// Sum of the computed valve percents of calling rooms.
    pub requested_open_percent: u32,
    /// Sum of the feedback-confirmed valve positions of calling rooms.
    pub confirmed_open_percent: u32,
    /// Valve percents in force right now, captured on entry to PendingOff.
    pub valves_in_force: &'a BTreeMap<RoomId, u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoilerAction {
    Transition {
        from: BoilerState,
        to: BoilerState,
        reason: &'static str,
    },
    SetBoiler {
        on: bool,
    },
    ArmTimer {
        timer: TimerKind,
        due_ms: u64,
    },
    CancelTimer {
        timer: TimerKind,
    },
    PersistValves,
    ReleaseValves,
}

#[derive(Debug, Clone)]
pub struct BoilerStateMachine {
    config: BoilerConfig,
    state: BoilerState,
    entered_ms: u64,
    timers: AntiCyclingTimers,
    persisted: ValvePersistenceStore,
    hold: Option<GuardHold>,
    history: VecDeque<TransitionRecord>,
}

impl BoilerStateMachine {
    pub fn new(config: BoilerConfig) -> Self {
        Self {
            config,
            state: BoilerState::Off,
            entered_ms: 0,
            timers: AntiCyclingTimers::new(),
            persisted: ValvePersistenceStore::new(),
            hold: None,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    /// Starts in `Off` with `min_off` armed from `now_ms`: the burner may
    /// have stopped just before the restart.
    pub fn after_restart(config: BoilerConfig, now_ms: u64) -> Self {
        let mut fsm = Self::new(config);
        fsm.entered_ms = now_ms;
        let min_off_ms = fsm.config.min_off_ms();
        fsm.timers.arm(TimerKind::MinOff, now_ms, min_off_ms);
        fsm
    }

    pub fn config(&self) -> &BoilerConfig {
        &self.config
    }

    pub fn state(&self) -> BoilerState {
        self.state
    }

    pub fn hold(&self) -> Option<GuardHold> {
        self.hold
    }

    pub fn is_boiler_on(&self) -> bool {
        self.state.is_firing()
    }

    pub fn is_valve_persistence_active(&self) -> bool {
        self.state.persists_valves()
    }

    pub fn persisted_valves(&self) -> &ValvePersistenceStore {
        &self.persisted
    }

    pub fn timers(&self) -> &AntiCyclingTimers {
        &self.timers
    }

    pub fn time_in_state_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.entered_ms)
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    /// Next instant at which a timer could unblock a transition.
    pub fn next_wake_ms(&self, now_ms: u64) -> Option<u64> {
        self.timers.next_due_ms(now_ms)
    }

    pub fn update(&mut self, input: &BoilerInput<'_>, now_ms: u64) -> Vec<BoilerAction> {
        let mut actions = Vec::new();
        let previous_hold = self.hold.take();

        for _ in 0..MAX_STEPS_PER_UPDATE {
            if !self.step(input, now_ms, &mut actions) {
                break;
            }
        }

        if self.hold != previous_hold {
            if let Some(hold) = self.hold {
                info!(
                    state = self.state.as_str(),
                    hold = hold.as_str(),
                    "{}",
                    hold.describe()
                );
            }
        }

        actions
    }

    fn step(&mut self, input: &BoilerInput<'_>, now_ms: u64, actions: &mut Vec<BoilerAction>) -> bool {
        let interlock = input.requested_open_percent >= self.config.min_valve_open_percent;
        let confirmed = input.confirmed_open_percent >= self.config.min_valve_open_percent;

        match self.state {
            BoilerState::Off => {
                if !input.demand {
                    return false;
                }
                if interlock {
                    self.transition(BoilerState::PendingOn, "demand", now_ms, actions);
                } else {
                    self.transition(
                        BoilerState::InterlockBlocked,
                        "demand without sufficient valve opening",
                        now_ms,
                        actions,
                    );
                }
                true
            }
            BoilerState::InterlockBlocked => {
                if !input.demand {
                    self.transition(BoilerState::Off, "demand cleared", now_ms, actions);
                    true
                } else if interlock {
                    self.transition(BoilerState::PendingOn, "interlock satisfied", now_ms, actions);
                    true
                } else {
                    false
                }
            }
            BoilerState::PendingOn => {
                if !input.demand {
                    self.transition(BoilerState::Off, "demand cleared", now_ms, actions);
                    return true;
                }
                if !interlock {
                    self.transition(
                        BoilerState::InterlockBlocked,
                        "valve opening dropped below interlock",
                        now_ms,
                        actions,
                    );
                    return true;
                }
                if !confirmed {
                    self.hold = Some(GuardHold::WaitingForValves);
                    return false;
                }
                if !self.timers.is_elapsed(TimerKind::MinOff, now_ms) {
                    self.hold = Some(GuardHold::WaitingForMinOff);
                    return false;
                }
                self.fire(now_ms, actions);
                self.transition(BoilerState::On, "valves confirmed open", now_ms, actions);
                true
            }
            BoilerState::On => {
                if input.demand {
                    return false;
                }
                self.arm(TimerKind::OffDelay, self.config.off_delay_ms(), now_ms, actions);
                self.persisted.capture(
                    input
                        .valves_in_force
                        .iter()
                        .map(|(room, percent)| (room.clone(), *percent)),
                );
                actions.push(BoilerAction::PersistValves);
                self.transition(BoilerState::PendingOff, "demand cleared", now_ms, actions);
                true
            }
            BoilerState::PendingOff => {
                if input.demand {
                    self.timers.cancel(TimerKind::OffDelay);
                    actions.push(BoilerAction::CancelTimer {
                        timer: TimerKind::OffDelay,
                    });
                    self.release(actions);
                    self.transition(
                        BoilerState::On,
                        "demand resumed during off delay",
                        now_ms,
                        actions,
                    );
                    return true;
                }
                if !self.timers.is_elapsed(TimerKind::OffDelay, now_ms) {
                    return false;
                }
                if !self.timers.is_elapsed(TimerKind::MinOn, now_ms) {
                    self.hold = Some(GuardHold::WaitingForMinOn);
                    return false;
                }
                self.arm(TimerKind::PumpOverrun, self.config.pump_overrun_ms(), now_ms, actions);
                self.arm(TimerKind::MinOff, self.config.min_off_ms(), now_ms, actions);
                self.transition(BoilerState::PumpOverrun, "off delay elapsed", now_ms, actions);
                true
            }
            BoilerState::PumpOverrun => {
                if input.demand {
                    if !self.timers.is_elapsed(TimerKind::MinOff, now_ms) {
                        self.hold = Some(GuardHold::WaitingForMinOff);
                        return false;
                    }
                    self.release(actions);
                    self.fire(now_ms, actions);
                    self.transition(
                        BoilerState::On,
                        "demand resumed after minimum off time",
                        now_ms,
                        actions,
                    );
                    return true;
                }
                if !self.timers.is_elapsed(TimerKind::PumpOverrun, now_ms) {
                    return false;
                }
                self.release(actions);
                self.transition(BoilerState::Off, "pump overrun complete", now_ms, actions);
                true
            }
        }
    }

    fn fire(&mut self, now_ms: u64, actions: &mut Vec<BoilerAction>) {
        self.arm(TimerKind::MinOn, self.config.min_on_ms(), now_ms, actions);
    }

    fn arm(
        &mut self,
        timer: TimerKind,
        duration_ms: u64,
        now_ms: u64,
        actions: &mut Vec<BoilerAction>,
    ) {
        self.timers.arm(timer, now_ms, duration_ms);
        actions.push(BoilerAction::ArmTimer {
            timer,
            due_ms: now_ms.saturating_add(duration_ms),
        });
    }

    fn release(&mut self, actions: &mut Vec<BoilerAction>) {
        if self.persisted.is_empty() {
            return;
        }
        self.persisted.release();
        actions.push(BoilerAction::ReleaseValves);
    }

    fn transition(
        &mut self,
        to: BoilerState,
        reason: &'static str,
        now_ms: u64,
        actions: &mut Vec<BoilerAction>,
    ) {
        let from = self.state;
        info!(
            from = from.as_str(),
            to = to.as_str(),
            reason,
            "boiler state change"
        );

        self.state = to;
        self.entered_ms = now_ms;
        self.hold = None;
        actions.push(BoilerAction::Transition { from, to, reason });
        if from.is_firing() != to.is_firing() {
            actions.push(BoilerAction::SetBoiler {
                on: to.is_firing(),
            });
        }

        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            at_ms: now_ms,
            from: from.as_str(),
            to: to.as_str(),
            reason,
        });
    }
}
