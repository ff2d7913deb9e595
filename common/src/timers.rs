use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    MinOn,
    MinOff,
    OffDelay,
    PumpOverrun,
}

impl TimerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MinOn => "min_on",
            Self::MinOff => "min_off",
            Self::OffDelay => "off_delay",
            Self::PumpOverrun => "pump_overrun",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deadline {
    start_ms: u64,
    duration_ms: u64,
}

impl Deadline {
    fn elapsed(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.start_ms) >= self.duration_ms
    }

    fn remaining_ms(&self, now_ms: u64) -> u64 {
        let elapsed = now_ms.saturating_sub(self.start_ms);
        self.duration_ms.saturating_sub(elapsed)
    }

    fn due_ms(&self) -> u64 {
        self.start_ms.saturating_add(self.duration_ms)
    }
}

/// Deadline table keyed by purpose. Arming a purpose replaces its previous
/// deadline; an elapsed deadline stays in the table but no longer blocks.
#[derive(Debug, Clone, Default)]
pub struct AntiCyclingTimers {
    deadlines: BTreeMap<TimerKind, Deadline>,
}

impl AntiCyclingTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, kind: TimerKind, now_ms: u64, duration_ms: u64) {
        self.deadlines.insert(
            kind,
            Deadline {
                start_ms: now_ms,
                duration_ms,
            },
        );
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines.remove(&kind);
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    /// An unarmed timer counts as elapsed.
    pub fn is_elapsed(&self, kind: TimerKind, now_ms: u64) -> bool {
        self.deadlines
            .get(&kind)
            .map(|deadline| deadline.elapsed(now_ms))
            .unwrap_or(true)
    }

    pub fn remaining_ms(&self, kind: TimerKind, now_ms: u64) -> u64 {
        self.deadlines
            .get(&kind)
            .map(|deadline| deadline.remaining_ms(now_ms))
            .unwrap_or(0)
    }

    pub fn due_ms(&self, kind: TimerKind) -> Option<u64> {
        self.deadlines.get(&kind).map(Deadline::due_ms)
    }

    /// Earliest deadline still in the future.
    pub fn next_due_ms(&self, now_ms: u64) -> Option<u64> {
        self.deadlines
            .values()
            .filter(|deadline| !deadline.elapsed(now_ms))
            .map(Deadline::due_ms)
            .min()
    }

    /// Remaining time of every timer that is still running.
    pub fn running(&self, now_ms: u64) -> impl Iterator<Item = (TimerKind, u64)> + '_ {
        self.deadlines
            .iter()
            .filter(move |(_, deadline)| !deadline.elapsed(now_ms))
            .map(move |(kind, deadline)| (*kind, deadline.remaining_ms(now_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_timer_is_elapsed() {
        let timers = AntiCyclingTimers::new();
        assert!(timers.is_elapsed(TimerKind::MinOff, 0));
        assert_eq!(timers.remaining_ms(TimerKind::MinOff, 0), 0);
    }

    #[test]
    fn elapses_exactly_at_duration() {
        let mut timers = AntiCyclingTimers::new();
        timers.arm(TimerKind::MinOff, 30_000, 30_000);

        assert!(!timers.is_elapsed(TimerKind::MinOff, 59_999));
        assert_eq!(timers.remaining_ms(TimerKind::MinOff, 41_000), 19_000);
        assert!(timers.is_elapsed(TimerKind::MinOff, 60_000));
        // Elapsed timers stay armed but inert.
        assert!(timers.is_armed(TimerKind::MinOff));
    }

    #[test]
    fn rearming_supersedes_previous_deadline() {
        let mut timers = AntiCyclingTimers::new();
        timers.arm(TimerKind::OffDelay, 0, 30_000);
        timers.arm(TimerKind::OffDelay, 20_000, 30_000);

        assert!(!timers.is_elapsed(TimerKind::OffDelay, 30_000));
        assert_eq!(timers.due_ms(TimerKind::OffDelay), Some(50_000));
    }

    #[test]
    fn next_due_skips_elapsed_timers() {
        let mut timers = AntiCyclingTimers::new();
        timers.arm(TimerKind::MinOn, 0, 10_000);
        timers.arm(TimerKind::PumpOverrun, 0, 60_000);
        timers.arm(TimerKind::MinOff, 0, 30_000);

        assert_eq!(timers.next_due_ms(5_000), Some(10_000));
        assert_eq!(timers.next_due_ms(10_000), Some(30_000));
        assert_eq!(timers.next_due_ms(60_000), None);

        let running: Vec<_> = timers.running(20_000).collect();
        assert_eq!(
            running,
            vec![(TimerKind::MinOff, 10_000), (TimerKind::PumpOverrun, 40_000)]
        );
    }
}
