use crate::utils::ScopeGuard;
use std::fmt;
use std::time::{Duration, Instant};

/// A unit of work posted to a task runner.
///
/// A `Task` owns its closure and can only be run once: running it consumes
/// it. It is deliberately not `Clone`, a copy taken before execution would
/// make double execution possible.
pub struct Task(Box<dyn FnOnce() + Send + 'static>);

impl Task {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task(Box::new(f))
    }

    /// Runs the task, consuming it.
    pub fn run(self) {
        (self.0)()
    }

    /// Runs the task and reports it if it took longer than `threshold`.
    ///
    /// The report also fires if the task panics, the panic itself keeps
    /// unwinding to the caller.
    pub(crate) fn run_guarded(self, threshold: Option<Duration>) {
        match threshold {
            Some(threshold) => {
                let _report = SlowTaskReport::start(threshold);
                self.run();
            }
            None => self.run(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Task").field(&"<closure>").finish()
    }
}

impl<F> From<F> for Task
where
    F: FnOnce() + Send + 'static,
{
    fn from(f: F) -> Self {
        Task::new(f)
    }
}

/// Reports, on drop, a task or watch callback that overran its budget.
pub(crate) struct SlowTaskReport {
    _guard: ScopeGuard<Box<dyn FnOnce()>>,
}

impl SlowTaskReport {
    pub(crate) fn start(threshold: Duration) -> Self {
        let started = Instant::now();

        Self {
            _guard: ScopeGuard::new(Box::new(move || {
                let elapsed = started.elapsed();
                if elapsed > threshold {
                    tracing::warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        threshold_ms = threshold.as_millis() as u64,
                        "task ran longer than the slow task threshold"
                    );
                }
            })),
        }
    }
}
