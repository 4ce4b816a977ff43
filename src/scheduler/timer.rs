// src/scheduler/timer.rs - One-shot deadline behind the emulated delay()
use std::time::{Duration, Instant};

/// A single pending wake-up. The system context checks it every tick and
/// turns an expired deadline into a schedule request.
#[derive(Debug, Default, Clone)]
pub struct DeadlineTimer {
    deadline: Option<Instant>,
}

impl DeadlineTimer {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Arm the timer to expire `after` from `now`.
    ///
    /// Returns `false` and leaves the pending deadline untouched when the
    /// timer is already armed: one delay owns at most one timer.
    pub fn arm(&mut self, now: Instant, after: Duration) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + after);
        true
    }

    /// Returns whether a deadline was pending.
    pub fn disarm(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Disarm and report `true` if the deadline has been reached.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_after_deadline() {
        let start = Instant::now();
        let mut timer = DeadlineTimer::new();
        assert!(timer.arm(start, Duration::from_millis(10)));
        assert!(!timer.fire_if_due(start + Duration::from_millis(5)));
        assert!(timer.fire_if_due(start + Duration::from_millis(10)));
        assert!(!timer.is_armed());
        assert!(!timer.fire_if_due(start + Duration::from_millis(20)));
    }

    #[test]
    fn rearming_a_pending_timer_is_refused() {
        let start = Instant::now();
        let mut timer = DeadlineTimer::new();
        assert!(timer.arm(start, Duration::from_millis(10)));
        assert!(!timer.arm(start, Duration::from_millis(1)));
        assert_eq!(timer.remaining(start), Some(Duration::from_millis(10)));
    }

    #[test]
    fn disarmed_timer_never_fires() {
        let start = Instant::now();
        let mut timer = DeadlineTimer::new();
        timer.arm(start, Duration::ZERO);
        assert!(timer.disarm());
        assert!(!timer.disarm());
        assert!(!timer.fire_if_due(start + Duration::from_secs(1)));
    }
}
