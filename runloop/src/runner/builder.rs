use crate::runner::{RunLoop, ThreadTaskRunner};
use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Tasks running longer than this get reported.
const SLOW_TASK_THRESHOLD: Duration = Duration::from_secs(180);

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let runner_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = runner_count.fetch_add(1, Ordering::Relaxed);
        format!("runloop-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Report tasks and watch callbacks that run longer than this. `None`
    /// disables the report.
    slow_task_threshold: Option<Duration>,

    /// Allocate a spare slab up front so the first slab switch does not hit
    /// the allocator.
    preallocate_free_slab: bool,

    /// Name fn used for threads spawned by [`Builder::try_spawn`].
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by [`Builder::try_spawn`].
    thread_stack_size: Option<usize>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            slow_task_threshold: Some(SLOW_TASK_THRESHOLD),
            preallocate_free_slab: true,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }

    /// Tasks and watch callbacks running longer than `val` are reported with
    /// a warning once they return.
    ///
    /// Defaults to 180 seconds.
    #[track_caller]
    pub fn slow_task_threshold(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "slow_task_threshold must be greater than 0");
        self.slow_task_threshold = Some(val);
        self
    }

    pub fn disable_slow_task_report(mut self) -> Self {
        self.slow_task_threshold = None;
        self
    }

    /// Only used by [`crate::LockFreeTaskRunner`].
    pub fn preallocate_free_slab(mut self, val: bool) -> Self {
        self.preallocate_free_slab = val;
        self
    }

    /// Sets the name of the thread spawned by [`Builder::try_spawn`].
    ///
    /// The default name is "runloop-{id}", where id is monotonically
    /// increasing.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by
    /// [`Builder::try_spawn`].
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for threads spawned by
    /// [`Builder::try_spawn`].
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates a runner bound to the calling thread.
    pub fn try_build<R: RunLoop>(self) -> Result<R> {
        R::with_config(self.into())
    }

    /// Creates a runner on a new thread and starts running it.
    pub fn try_spawn<R: RunLoop>(self) -> Result<ThreadTaskRunner<R>> {
        ThreadTaskRunner::spawn(self.into())
    }
}

// Export the builder as a RunnerConfig object consumed by every runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub(crate) slow_task_threshold: Option<Duration>,
    pub(crate) preallocate_free_slab: bool,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Builder::new().into()
    }
}

impl From<Builder> for RunnerConfig {
    fn from(builder: Builder) -> Self {
        RunnerConfig {
            slow_task_threshold: builder.slow_task_threshold,
            preallocate_free_slab: builder.preallocate_free_slab,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(RunnerConfig: Send, Sync, Clone);

    #[test]
    fn test_defaults() {
        let cfg = RunnerConfig::default();

        assert_eq!(cfg.slow_task_threshold, Some(SLOW_TASK_THRESHOLD));
        assert!(cfg.preallocate_free_slab);
        assert_eq!(cfg.thread_stack_size, None);
    }

    #[test]
    fn test_default_thread_names_increase() {
        let cfg = RunnerConfig::default();

        assert_eq!((cfg.thread_name.0)(), "runloop-0");
        assert_eq!((cfg.thread_name.0)(), "runloop-1");
    }

    #[test]
    fn test_setters() {
        let cfg: RunnerConfig = Builder::new()
            .disable_slow_task_report()
            .preallocate_free_slab(false)
            .thread_name("io")
            .thread_stack_size(1 << 20)
            .into();

        assert_eq!(cfg.slow_task_threshold, None);
        assert!(!cfg.preallocate_free_slab);
        assert_eq!((cfg.thread_name.0)(), "io");
        assert_eq!(cfg.thread_stack_size, Some(1 << 20));
    }

    #[rstest]
    #[case::not_power_of_two(3 * 1024)]
    #[case::zero(0)]
    #[should_panic(expected = "thread_stack_size must be a power of two")]
    fn test_invalid_stack_size(#[case] val: usize) {
        let _ = Builder::new().thread_stack_size(val);
    }

    #[test]
    #[should_panic(expected = "slow_task_threshold must be greater than 0")]
    fn test_zero_slow_task_threshold() {
        let _ = Builder::new().slow_task_threshold(Duration::ZERO);
    }
}
