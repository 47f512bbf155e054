//! Clock and delayed task bookkeeping shared by all runners.

use crate::task::Task;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// Roughly 30 years.
const FAR_FUTURE_SECS: u64 = 30 * 365 * 24 * 3600;

/// Monotonic clock that tests can move forward.
#[derive(Debug)]
pub(crate) struct Clock {
    // Virtual time offset, in nanoseconds.
    advanced: AtomicU64,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            advanced: AtomicU64::new(0),
        }
    }

    pub(crate) fn now(&self) -> Instant {
        Instant::now() + Duration::from_nanos(self.advanced.load(Ordering::Relaxed))
    }

    /// `now() + delay`, clamped far into the future instead of overflowing.
    pub(crate) fn deadline(&self, delay: Duration) -> Instant {
        let now = self.now();
        now.checked_add(delay)
            .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS))
    }

    /// Saturates instead of wrapping, the clock never goes backwards.
    pub(crate) fn advance(&self, delta: Duration) {
        let nanos = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .advanced
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |advanced| {
                Some(advanced.saturating_add(nanos))
            });
    }
}

struct DelayedTask {
    due: Instant,
    seq: u64,
    task: Task,
}

impl DelayedTask {
    fn key(&self) -> (Instant, u64) {
        (self.due, self.seq)
    }
}

/// Delayed tasks sorted by `(due, seq)` in *descending* order, so the next
/// task to expire sits at the end of the vector and pops in O(1).
pub(crate) struct DelayedTasks {
    tasks: Vec<DelayedTask>,
    next_seq: u64,
}

impl DelayedTasks {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Vec::new(),
            next_seq: 0,
        }
    }

    /// Schedules `task` at `due`. Tasks due at the same instant pop in
    /// insertion order.
    pub(crate) fn insert(&mut self, due: Instant, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let key = (due, seq);
        let at = self.tasks.partition_point(|t| t.key() > key);
        self.tasks.insert(at, DelayedTask { due, seq, task });
    }

    /// Pops the next task if it is due at `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<Task> {
        if self.tasks.last()?.due <= now {
            self.tasks.pop().map(|t| t.task)
        } else {
            None
        }
    }

    /// Time left until the next task is due, `None` if nothing is scheduled.
    pub(crate) fn delay_to_next(&self, now: Instant) -> Option<Duration> {
        self.tasks
            .last()
            .map(|t| t.due.saturating_duration_since(now))
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Debug for DelayedTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedTasks")
            .field("len", &self.len())
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};
    use parking_lot::Mutex;
    use rstest::rstest;
    use std::sync::Arc;

    fn recording_task(log: &Arc<Mutex<Vec<&'static str>>>, value: &'static str) -> Task {
        let log = log.clone();
        Task::new(move || log.lock().push(value))
    }

    #[test]
    fn test_clock_advance() {
        let clock = Clock::new();
        let before = clock.now();

        clock.advance(Duration::from_secs(3600));
        assert!(clock.now() >= before + Duration::from_secs(3600));
    }

    #[test]
    fn test_clock_advance_saturates() {
        let clock = Clock::new();
        let before = clock.now();

        clock.advance(Duration::from_nanos(u64::MAX - 1));
        clock.advance(Duration::from_secs(10));
        clock.advance(Duration::MAX);

        assert_eq!(clock.advanced.load(Ordering::Relaxed), u64::MAX);
        assert!(clock.now() >= before + Duration::from_nanos(u64::MAX));
    }

    #[test]
    fn test_deadline_does_not_overflow() {
        let clock = Clock::new();

        assert!(clock.deadline(Duration::from_millis(10)) > clock.now());
        assert!(clock.deadline(Duration::MAX) > clock.now() + Duration::from_secs(3600));
    }

    #[test]
    fn test_empty() {
        let mut delayed = DelayedTasks::new();
        let now = Instant::now();

        assert!(delayed.is_empty());
        assert!(delayed.pop_expired(now).is_none());
        assert_eq!(delayed.delay_to_next(now), None);
    }

    #[rstest]
    #[case::in_order(&[(10, "a"), (20, "b"), (30, "c")], "abc")]
    #[case::reversed(&[(30, "c"), (20, "b"), (10, "a")], "abc")]
    #[case::ties_keep_insertion_order(&[(10, "a"), (10, "b"), (5, "0"), (10, "c")], "0abc")]
    #[case::zero_delay(&[(0, "a"), (0, "b")], "ab")]
    fn test_pop_order(#[case] delays: &[(u64, &'static str)], #[case] expected: &str) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut delayed = DelayedTasks::new();
        let start = Instant::now();

        for (ms, value) in delays {
            delayed.insert(start + Duration::from_millis(*ms), recording_task(&log, *value));
        }

        let end = start + Duration::from_secs(1);
        while let Some(task) = delayed.pop_expired(end) {
            task.run();
        }

        assert!(delayed.is_empty());
        assert_eq!(log.lock().concat(), expected);
    }

    #[test]
    fn test_only_expired_tasks_pop() -> Result<()> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut delayed = DelayedTasks::new();
        let start = Instant::now();

        delayed.insert(start + Duration::from_millis(100), recording_task(&log, "late"));
        delayed.insert(start + Duration::from_millis(10), recording_task(&log, "early"));

        assert_eq!(
            delayed.delay_to_next(start),
            Some(Duration::from_millis(10))
        );

        let now = start + Duration::from_millis(50);
        delayed.pop_expired(now).context("early task is due")?.run();
        assert!(delayed.pop_expired(now).is_none());
        assert_eq!(delayed.delay_to_next(now), Some(Duration::from_millis(50)));

        // Overdue tasks report a zero delay.
        let now = start + Duration::from_millis(500);
        assert_eq!(delayed.delay_to_next(now), Some(Duration::ZERO));
        delayed.pop_expired(now).context("late task is due")?.run();

        assert_eq!(*log.lock(), vec!["early", "late"]);
        Ok(())
    }
}
