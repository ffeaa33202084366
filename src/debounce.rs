//! Debounced write scheduling.
//!
//! A `Debouncer` owns the pending snapshot of one key. Scheduling a new
//! snapshot replaces the previous one and restarts the quiet period, so a
//! burst of changes collapses into a single write of the last value.

use crate::clock::Clock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pending snapshot plus the instant it becomes due.
struct Pending<T> {
    snapshot: T,
    due: Instant,
}

/// Counters for one debouncer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebounceStats {
    /// Snapshots handed to `schedule`.
    pub scheduled: u64,
    /// Snapshots replaced before they fired.
    pub superseded: u64,
    /// Snapshots released for writing.
    pub fired: u64,
}

/// Per-key pending write with a restartable deadline.
pub struct Debouncer<T> {
    delay: Duration,
    clock: Arc<dyn Clock>,
    pending: Option<Pending<T>>,
    stats: DebounceStats,
}

impl<T> Debouncer<T> {
    pub fn new(delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            delay,
            clock,
            pending: None,
            stats: DebounceStats::default(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Replace the pending snapshot and restart the quiet period.
    ///
    /// Returns true if an earlier snapshot was superseded.
    pub fn schedule(&mut self, snapshot: T) -> bool {
        let due = self.clock.now() + self.delay;
        let superseded = self.pending.replace(Pending { snapshot, due }).is_some();
        self.stats.scheduled += 1;
        if superseded {
            self.stats.superseded += 1;
        }
        superseded
    }

    /// Take the snapshot if its quiet period has elapsed.
    pub fn take_due(&mut self) -> Option<T> {
        let now = self.clock.now();
        match &self.pending {
            Some(p) if p.due <= now => self.take_now(),
            _ => None,
        }
    }

    /// Take the snapshot regardless of its deadline.
    pub fn take_now(&mut self) -> Option<T> {
        let pending = self.pending.take()?;
        self.stats.fired += 1;
        Some(pending.snapshot)
    }

    /// Drop the pending snapshot without firing it.
    pub fn cancel(&mut self) -> Option<T> {
        self.pending.take().map(|p| p.snapshot)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn due_at(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.due)
    }

    pub fn stats(&self) -> DebounceStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn debouncer(clock: &ManualClock) -> Debouncer<u32> {
        Debouncer::new(Duration::from_millis(500), Arc::new(clock.clone()))
    }

    #[test]
    fn test_not_due_before_quiet_period() {
        let clock = ManualClock::new();
        let mut d = debouncer(&clock);
        d.schedule(1);
        clock.advance(Duration::from_millis(499));
        assert_eq!(d.take_due(), None);
        clock.advance(Duration::from_millis(1));
        assert_eq!(d.take_due(), Some(1));
        assert!(!d.is_pending());
    }

    #[test]
    fn test_burst_collapses_to_last() {
        let clock = ManualClock::new();
        let mut d = debouncer(&clock);
        for i in 0..10 {
            d.schedule(i);
            clock.advance(Duration::from_millis(100));
        }
        // Deadline restarted on the last schedule.
        assert_eq!(d.take_due(), None);
        clock.advance(Duration::from_millis(400));
        assert_eq!(d.take_due(), Some(9));
        assert_eq!(d.take_due(), None);

        let stats = d.stats();
        assert_eq!(stats.scheduled, 10);
        assert_eq!(stats.superseded, 9);
        assert_eq!(stats.fired, 1);
    }

    #[test]
    fn test_take_now_and_cancel() {
        let clock = ManualClock::new();
        let mut d = debouncer(&clock);
        d.schedule(7);
        assert_eq!(d.take_now(), Some(7));
        d.schedule(8);
        assert_eq!(d.cancel(), Some(8));
        assert_eq!(d.take_now(), None);
        assert_eq!(d.stats().fired, 1);
    }
}
