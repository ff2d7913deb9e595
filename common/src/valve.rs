use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::{
    config::ValveConfig,
    types::{Actuation, RoomId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Target already commanded; nothing sent.
    Unchanged,
    Sent,
    RateLimited,
    Confirmed,
    Retrying,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveCommand {
    pub target_percent: u8,
    /// Resends made for this target; the first send is not counted.
    pub attempt_count: u8,
    pub last_sent_ms: u64,
    pub awaiting_feedback: bool,
}

#[derive(Debug, Clone, Default)]
struct ValveChannel {
    last_commanded: Option<u8>,
    last_command_ms: Option<u64>,
    confirmed: Option<u8>,
    feedback: Option<u8>,
    in_flight: Option<ValveCommand>,
    failed_target: Option<u8>,
    // Target held back by the rate limit, retried once the window opens.
    deferred: Option<u8>,
}

/// Drives every room's TRV: command, await feedback, retry, give up.
#[derive(Debug, Clone)]
pub struct ValveActuator {
    config: ValveConfig,
    channels: BTreeMap<RoomId, ValveChannel>,
}

impl ValveActuator {
    pub fn new<I, S>(config: ValveConfig, rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RoomId>,
    {
        Self {
            config,
            channels: rooms
                .into_iter()
                .map(|room| (room.into(), ValveChannel::default()))
                .collect(),
        }
    }

    pub fn config(&self) -> &ValveConfig {
        &self.config
    }

    pub fn set(
        &mut self,
        room_id: &str,
        target_percent: u8,
        now_ms: u64,
        protective: bool,
        actions: &mut Vec<Actuation>,
    ) -> CommandOutcome {
        debug_assert!(target_percent <= 100, "valve target out of range");
        let min_interval_ms = self.config.min_interval_ms();
        let Some(channel) = self.channels.get_mut(room_id) else {
            warn!(room = room_id, "command for unknown valve ignored");
            return CommandOutcome::Unchanged;
        };

        if channel.last_commanded == Some(target_percent) {
            channel.deferred = None;
            return CommandOutcome::Unchanged;
        }

        if !protective && channel.rate_limited(now_ms, min_interval_ms) {
            if channel.deferred != Some(target_percent) {
                debug!(
                    room = room_id,
                    target_percent, "valve command rate limited"
                );
            }
            channel.deferred = Some(target_percent);
            return CommandOutcome::RateLimited;
        }

        channel.send(room_id, target_percent, now_ms, actions);
        info!(
            room = room_id,
            target_percent, protective, "valve command sent"
        );
        CommandOutcome::Sent
    }

    /// Latest position reported by the valve, `None` when unavailable.
    pub fn record_feedback(&mut self, room_id: &str, percent: Option<u8>) {
        match self.channels.get_mut(room_id) {
            Some(channel) => channel.feedback = percent.map(|value| value.min(100)),
            None => warn!(room = room_id, "feedback for unknown valve ignored"),
        }
    }

    /// Runs due confirmation checks and feedback-driven corrections.
    ///
    /// Corrections are suppressed while `persistence_active` is set so a
    /// correction loop never races the persisted valve positions.
    pub fn poll(
        &mut self,
        now_ms: u64,
        persistence_active: bool,
        actions: &mut Vec<Actuation>,
    ) -> Vec<(RoomId, CommandOutcome)> {
        let confirm_delay_ms = self.config.confirm_delay_ms();
        let min_interval_ms = self.config.min_interval_ms();
        let tolerance = self.config.feedback_tolerance_percent;
        let max_attempts = self.config.max_attempts;
        let mut outcomes = Vec::new();

        for (room_id, channel) in &mut self.channels {
            if let Some(command) = channel.in_flight {
                if now_ms.saturating_sub(command.last_sent_ms) < confirm_delay_ms {
                    continue;
                }
                let outcome = channel.check(room_id, command, now_ms, tolerance, max_attempts, actions);
                outcomes.push((room_id.clone(), outcome));
                continue;
            }

            if let Some(target) = channel.deferred {
                if !channel.rate_limited(now_ms, min_interval_ms) {
                    channel.send(room_id, target, now_ms, actions);
                    info!(room = %room_id, target, "deferred valve command sent");
                    outcomes.push((room_id.clone(), CommandOutcome::Sent));
                }
                continue;
            }

            let (Some(commanded), Some(feedback)) = (channel.last_commanded, channel.feedback) else {
                continue;
            };
            if within(feedback, commanded, tolerance) {
                channel.confirmed = Some(commanded);
                channel.failed_target = None;
                continue;
            }

            channel.confirmed = None;
            if persistence_active || channel.failed_target == Some(commanded) {
                continue;
            }
            if channel.rate_limited(now_ms, min_interval_ms) {
                continue;
            }
            info!(
                room = %room_id,
                commanded,
                feedback,
                "valve drifted from commanded position, correcting"
            );
            channel.send(room_id, commanded, now_ms, actions);
            outcomes.push((room_id.clone(), CommandOutcome::Sent));
        }

        outcomes
    }

    pub fn last_commanded(&self, room_id: &str) -> Option<u8> {
        self.channels.get(room_id).and_then(|channel| channel.last_commanded)
    }

    pub fn last_command_ms(&self, room_id: &str) -> Option<u64> {
        self.channels.get(room_id).and_then(|channel| channel.last_command_ms)
    }

    pub fn confirmed(&self, room_id: &str) -> Option<u8> {
        self.channels.get(room_id).and_then(|channel| channel.confirmed)
    }

    pub fn in_flight(&self, room_id: &str) -> Option<ValveCommand> {
        self.channels.get(room_id).and_then(|channel| channel.in_flight)
    }

    pub fn is_failed(&self, room_id: &str) -> bool {
        self.channels
            .get(room_id)
            .map(|channel| channel.failed_target.is_some() && channel.failed_target == channel.last_commanded)
            .unwrap_or(false)
    }

    /// Commanded percent of every valve; never-commanded valves count as closed.
    pub fn commanded_percents(&self) -> BTreeMap<RoomId, u8> {
        self.channels
            .iter()
            .map(|(room_id, channel)| (room_id.clone(), channel.last_commanded.unwrap_or(0)))
            .collect()
    }

    /// Earliest pending confirmation check or rate-limit expiry.
    pub fn next_wake_ms(&self) -> Option<u64> {
        let confirm_delay_ms = self.config.confirm_delay_ms();
        let min_interval_ms = self.config.min_interval_ms();

        self.channels
            .values()
            .filter_map(|channel| {
                if let Some(command) = channel.in_flight {
                    return Some(command.last_sent_ms.saturating_add(confirm_delay_ms));
                }
                channel.deferred?;
                Some(
                    channel
                        .last_command_ms
                        .unwrap_or(0)
                        .saturating_add(min_interval_ms),
                )
            })
            .min()
    }
}

impl ValveChannel {
    fn rate_limited(&self, now_ms: u64, min_interval_ms: u64) -> bool {
        self.last_command_ms
            .map(|last| now_ms.saturating_sub(last) < min_interval_ms)
            .unwrap_or(false)
    }

    fn send(&mut self, room_id: &str, target_percent: u8, now_ms: u64, actions: &mut Vec<Actuation>) {
        self.last_commanded = Some(target_percent);
        self.last_command_ms = Some(now_ms);
        self.confirmed = None;
        self.failed_target = None;
        self.deferred = None;
        self.in_flight = Some(ValveCommand {
            target_percent,
            attempt_count: 0,
            last_sent_ms: now_ms,
            awaiting_feedback: true,
        });
        actions.push(Actuation::CommandValve {
            room_id: room_id.to_string(),
            percent: target_percent,
        });
    }

    fn check(
        &mut self,
        room_id: &str,
        mut command: ValveCommand,
        now_ms: u64,
        tolerance: u8,
        max_attempts: u8,
        actions: &mut Vec<Actuation>,
    ) -> CommandOutcome {
        let target = command.target_percent;

        if self
            .feedback
            .map(|feedback| within(feedback, target, tolerance))
            .unwrap_or(false)
        {
            debug!(room = room_id, target, attempts = command.attempt_count, "valve confirmed");
            self.confirmed = Some(target);
            self.in_flight = None;
            return CommandOutcome::Confirmed;
        }

        if command.attempt_count < max_attempts {
            command.attempt_count += 1;
            command.last_sent_ms = now_ms;
            self.in_flight = Some(command);
            self.last_command_ms = Some(now_ms);
            info!(
                room = room_id,
                target,
                feedback = ?self.feedback,
                attempt = command.attempt_count,
                "valve feedback mismatch, resending"
            );
            actions.push(Actuation::CommandValve {
                room_id: room_id.to_string(),
                percent: target,
            });
            return CommandOutcome::Retrying;
        }

        warn!(
            room = room_id,
            target,
            feedback = ?self.feedback,
            attempts = command.attempt_count,
            "valve did not confirm position, leaving command in place"
        );
        self.in_flight = None;
        self.failed_target = Some(target);
        CommandOutcome::Failed
    }
}

fn within(feedback: u8, target: u8, tolerance: u8) -> bool {
    feedback.abs_diff(target) <= tolerance
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn actuator() -> ValveActuator {
        ValveActuator::new(ValveConfig::default(), ["hall", "study"])
    }

    fn command(room: &str, percent: u8) -> Actuation {
        Actuation::CommandValve {
            room_id: room.to_string(),
            percent,
        }
    }

    #[test]
    fn sends_and_confirms() {
        let mut valves = actuator();
        let mut actions = Vec::new();

        assert_eq!(valves.set("hall", 60, 0, false, &mut actions), CommandOutcome::Sent);
        assert_eq!(actions, vec![command("hall", 60)]);
        assert!(valves.in_flight("hall").is_some());

        valves.record_feedback("hall", Some(59));
        assert!(valves.poll(1_999, false, &mut actions).is_empty());

        let outcomes = valves.poll(2_000, false, &mut actions);
        assert_eq!(outcomes, vec![("hall".to_string(), CommandOutcome::Confirmed)]);
        assert_eq!(valves.confirmed("hall"), Some(60));
        assert!(valves.in_flight("hall").is_none());
    }

    #[test]
    fn same_target_is_not_resent() {
        let mut valves = actuator();
        let mut actions = Vec::new();
        valves.set("hall", 60, 0, false, &mut actions);

        assert_eq!(
            valves.set("hall", 60, 0, false, &mut actions),
            CommandOutcome::Unchanged
        );
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn rate_limits_unless_protective() {
        let mut valves = actuator();
        let mut actions = Vec::new();
        valves.set("hall", 60, 0, false, &mut actions);

        assert_eq!(
            valves.set("hall", 100, 10_000, false, &mut actions),
            CommandOutcome::RateLimited
        );
        assert_eq!(valves.last_commanded("hall"), Some(60));
        assert_eq!(valves.next_wake_ms(), Some(2_000));

        assert_eq!(
            valves.set("hall", 100, 10_000, true, &mut actions),
            CommandOutcome::Sent
        );
        assert_eq!(valves.last_commanded("hall"), Some(100));
    }

    #[test]
    fn deferred_command_goes_out_when_window_opens() {
        let mut valves = actuator();
        let mut actions = Vec::new();
        valves.set("hall", 60, 0, false, &mut actions);
        valves.record_feedback("hall", Some(60));
        valves.poll(2_000, false, &mut actions);

        valves.set("hall", 100, 10_000, false, &mut actions);
        assert_eq!(valves.next_wake_ms(), Some(30_000));

        actions.clear();
        valves.poll(29_999, false, &mut actions);
        assert!(actions.is_empty());

        let outcomes = valves.poll(30_000, false, &mut actions);
        assert_eq!(outcomes, vec![("hall".to_string(), CommandOutcome::Sent)]);
        assert_eq!(actions, vec![command("hall", 100)]);
    }

    #[test]
    fn retries_then_fails_without_storming() {
        let mut valves = actuator();
        let mut actions = Vec::new();
        valves.set("study", 100, 0, false, &mut actions);
        valves.record_feedback("study", Some(0));

        for now_ms in [2_000, 4_000, 6_000] {
            let outcomes = valves.poll(now_ms, false, &mut actions);
            assert_eq!(outcomes, vec![("study".to_string(), CommandOutcome::Retrying)]);
        }
        assert_eq!(valves.in_flight("study").map(|command| command.attempt_count), Some(3));

        let outcomes = valves.poll(8_000, false, &mut actions);
        assert_eq!(outcomes, vec![("study".to_string(), CommandOutcome::Failed)]);

        assert_eq!(actions, vec![command("study", 100); 4]);
        assert!(valves.is_failed("study"));
        assert_eq!(valves.last_commanded("study"), Some(100));

        // A jammed valve is not chased with further corrections.
        assert!(valves.poll(120_000, false, &mut actions).is_empty());
        assert_eq!(actions.len(), 4);
    }

    #[test]
    fn silent_valve_is_retried_then_given_up() {
        let mut valves = actuator();
        let mut actions = Vec::new();
        valves.set("hall", 60, 0, false, &mut actions);
        valves.record_feedback("hall", None);

        for now_ms in [2_000, 4_000, 6_000] {
            let outcomes = valves.poll(now_ms, false, &mut actions);
            assert_eq!(outcomes, vec![("hall".to_string(), CommandOutcome::Retrying)]);
        }
        let outcomes = valves.poll(8_000, false, &mut actions);
        assert_eq!(outcomes, vec![("hall".to_string(), CommandOutcome::Failed)]);
        assert_eq!(actions, vec![command("hall", 60); 4]);
        assert_eq!(valves.confirmed("hall"), None);
        assert_eq!(valves.next_wake_ms(), None);

        for now_ms in [10_000, 40_000, 300_000] {
            assert!(valves.poll(now_ms, false, &mut actions).is_empty());
        }
        assert_eq!(actions.len(), 4);
    }

    #[test]
    fn late_arrival_clears_failure() {
        let mut valves = actuator();
        let mut actions = Vec::new();
        valves.set("study", 100, 0, false, &mut actions);
        valves.record_feedback("study", Some(0));
        for now_ms in [2_000, 4_000, 6_000, 8_000] {
            valves.poll(now_ms, false, &mut actions);
        }
        assert!(valves.is_failed("study"));

        valves.record_feedback("study", Some(99));
        assert!(valves.poll(60_000, false, &mut actions).is_empty());

        assert!(!valves.is_failed("study"));
        assert_eq!(valves.confirmed("study"), Some(100));
    }

    #[test]
    fn drift_is_corrected_outside_persistence() {
        let mut valves = actuator();
        let mut actions = Vec::new();
        valves.set("hall", 60, 0, false, &mut actions);
        valves.record_feedback("hall", Some(60));
        valves.poll(2_000, false, &mut actions);
        actions.clear();

        valves.record_feedback("hall", Some(20));
        assert!(valves.poll(60_000, true, &mut actions).is_empty());
        assert!(actions.is_empty());
        assert_eq!(valves.confirmed("hall"), None);

        let outcomes = valves.poll(61_000, false, &mut actions);
        assert_eq!(outcomes, vec![("hall".to_string(), CommandOutcome::Sent)]);
        assert_eq!(actions, vec![command("hall", 60)]);
    }

    #[test]
    fn unknown_rooms_are_ignored() {
        let mut valves = actuator();
        let mut actions = Vec::new();

        assert_eq!(
            valves.set("attic", 50, 0, false, &mut actions),
            CommandOutcome::Unchanged
        );
        valves.record_feedback("attic", Some(50));
        assert!(actions.is_empty());
    }

    #[test]
    fn commanded_percents_default_to_closed() {
        let mut valves = actuator();
        let mut actions = Vec::new();
        valves.set("hall", 80, 0, false, &mut actions);

        assert_eq!(
            valves.commanded_percents(),
            BTreeMap::from([("hall".to_string(), 80), ("study".to_string(), 0)])
        );
    }
}
