use crate::task::Task;
use crate::watch::WatchCallback;
use std::os::fd::RawFd;
use std::time::Duration;

mod builder;
pub use builder::{Builder, RunnerConfig};

mod epoch;
pub(crate) use epoch::RunEpoch;

pub mod lock_free;
pub use lock_free::LockFreeTaskRunner;

mod thread;
pub use thread::ThreadTaskRunner;

mod unix;
pub use unix::UnixTaskRunner;

// Used wherever we rely on SmallVec to store entries on stack first. The
// runner thread rarely has more than a handful of ready fds or slabs.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 16;

/// Producer side of a task runner: everything that can be called from any
/// thread.
///
/// Object safe, so subsystems can hold an `Arc<dyn TaskRunner>` without
/// caring about the backend.
pub trait TaskRunner: Send + Sync {
    /// Schedules `task` to run on the runner thread. Never blocks.
    ///
    /// Tasks posted from one thread run in the order they were posted. There
    /// is no ordering between tasks posted concurrently from different
    /// threads.
    fn post_task(&self, task: Task);

    /// Schedules `task` to run no earlier than `delay` from now. Tasks due at
    /// the same time run in the order they were posted.
    fn post_delayed_task(&self, task: Task, delay: Duration);

    /// Runs `callback` on the runner thread whenever `fd` is readable, hung
    /// up or in error. The callback is not invoked again until its previous
    /// invocation returned.
    ///
    /// # Panics
    ///
    /// If `fd` is already watched. Backends that apply off-thread calls on
    /// the runner thread panic there instead of in the caller.
    fn add_file_descriptor_watch(&self, fd: RawFd, callback: WatchCallback);

    /// Stops watching `fd`. A callback already scheduled for `fd` is dropped.
    ///
    /// # Panics
    ///
    /// If `fd` is not watched.
    fn remove_file_descriptor_watch(&self, fd: RawFd);

    /// Whether the caller is on the thread that runs the tasks.
    fn runs_tasks_on_current_thread(&self) -> bool;
}

/// Consumer side of a task runner. The thread that creates the runner is the
/// one that must call [`RunLoop::run`].
pub trait RunLoop: TaskRunner + Clone + Sized + 'static {
    fn with_config(cfg: RunnerConfig) -> anyhow::Result<Self>;

    fn try_new() -> anyhow::Result<Self> {
        Self::with_config(RunnerConfig::default())
    }

    /// Runs tasks, delayed tasks and watch callbacks until [`RunLoop::quit`].
    /// Can be called again after it returned, but never nested.
    ///
    /// # Panics
    ///
    /// If called after [`RunLoop::shutdown`].
    fn run(&self);

    /// Makes [`RunLoop::run`] return. Callable from any thread.
    ///
    /// On the runner thread the loop returns once the current task is done.
    /// From other threads the quit is queued like a task, so everything
    /// posted before it still runs. It ends the `run()` active when it was
    /// made, or the next one if none was, and is ignored by any later run.
    /// A quit made on the runner thread outside of `run()` is discarded when
    /// the next `run()` starts.
    fn quit(&self);

    /// Drops every queued task, delayed task and watch, then drops anything
    /// posted afterwards. Pending tasks holding a handle to their own runner
    /// keep it alive until this is called.
    ///
    /// # Panics
    ///
    /// If called off the runner thread or from inside [`RunLoop::run`].
    fn shutdown(&self);

    /// No posted task is waiting to run. Runner thread only.
    fn is_idle_for_testing(&self) -> bool;

    /// Moves the runner's clock forward by `delta`. Callable from any thread.
    fn advance_time_for_testing(&self, delta: Duration);
}
