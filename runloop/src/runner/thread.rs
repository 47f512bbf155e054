use crate::error::RunnerError;
use crate::runner::{Builder, RunLoop, RunnerConfig};
use crate::task::Task;
use crate::utils::ScopeGuard;
use anyhow::Result;
use std::fmt;
use std::ops::Deref;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// A task runner running on its own thread.
///
/// The runner is created on the new thread, so that thread is the one that
/// runs the tasks. Dropping the `ThreadTaskRunner` quits the loop and joins
/// the thread. Once the loop returned, the thread shuts the runner down:
/// pending work is dropped and later posts are discarded. Derefs to the
/// runner to post tasks.
pub struct ThreadTaskRunner<R: RunLoop> {
    runner: R,

    thread: Option<JoinHandle<()>>,
}

impl<R: RunLoop> ThreadTaskRunner<R> {
    /// Spawns a runner thread named `name` with the default configuration.
    pub fn create_and_start(name: impl Into<String>) -> Result<Self> {
        Builder::new().thread_name(name).try_spawn()
    }

    pub(crate) fn spawn(cfg: RunnerConfig) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Result<R>>(1);

        let mut builder = thread::Builder::new().name((cfg.thread_name.0)());
        if let Some(stack_size) = cfg.thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        let thread = builder
            .spawn(move || {
                let runner = match R::with_config(cfg) {
                    Ok(runner) => runner,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };

                if tx.send(Ok(runner.clone())).is_err() {
                    return;
                }
                drop(tx);

                // Also on panic, so queued tasks holding a handle don't keep
                // the runner alive.
                let _shutdown = ScopeGuard::new(|| runner.shutdown());

                debug!("runner thread started");
                runner.run();
                debug!("runner thread exiting");
            })
            .map_err(RunnerError::ThreadSpawn)?;

        // The sender is dropped without sending if the thread panics while
        // building the runner.
        let runner = rx.recv().map_err(|_| RunnerError::ThreadExited)??;

        Ok(Self {
            runner,
            thread: Some(thread),
        })
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Posts `task` and blocks until it ran on the runner thread.
    ///
    /// # Panics
    ///
    /// If called from the runner thread, if the task panics, or if the runner
    /// quit before getting to it.
    #[track_caller]
    pub fn post_task_and_wait_for_testing(&self, task: Task) {
        assert!(
            !self.runner.runs_tasks_on_current_thread(),
            "post_task_and_wait_for_testing() would deadlock on the runner thread"
        );

        let (tx, rx) = mpsc::sync_channel(1);
        self.runner.post_task(Task::new(move || {
            task.run();
            let _ = tx.send(());
        }));

        rx.recv()
            .expect("runner thread dropped the task without running it");
    }
}

impl<R: RunLoop> Deref for ThreadTaskRunner<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.runner
    }
}

impl<R: RunLoop> Drop for ThreadTaskRunner<R> {
    fn drop(&mut self) {
        self.runner.quit();

        let Some(thread) = self.thread.take() else {
            return;
        };

        // Dropping from a task on the runner thread can't join itself.
        if thread.thread().id() == thread::current().id() {
            return;
        }

        let name = thread.thread().name().map(str::to_owned);
        if thread.join().is_err() {
            error!(?name, "runner thread panicked");
        }
    }
}

impl<R: RunLoop + fmt::Debug> fmt::Debug for ThreadTaskRunner<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadTaskRunner")
            .field("runner", &self.runner)
            .field("thread", &self.thread.as_ref().map(|t| t.thread().id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{LockFreeTaskRunner, TaskRunner, UnixTaskRunner};
    use crate::test_utils::get_current_thread_name;
    use parking_lot::Mutex;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    assert_impl_all!(ThreadTaskRunner<LockFreeTaskRunner>: Send, Sync);
    assert_impl_all!(ThreadTaskRunner<UnixTaskRunner>: Send, Sync);

    #[test]
    fn test_runs_on_named_thread() -> Result<()> {
        let runner = Builder::new()
            .thread_name("rl-test")
            .try_spawn::<LockFreeTaskRunner>()?;
        assert!(!runner.runs_tasks_on_current_thread());

        let seen = Arc::new(Mutex::new(None));
        runner.post_task_and_wait_for_testing(Task::new({
            let seen = seen.clone();
            move || *seen.lock() = Some(get_current_thread_name())
        }));

        let name = seen.lock().take().expect("task ran")?;
        assert_eq!(name, "rl-test");
        Ok(())
    }

    #[test]
    fn test_drop_quits_and_joins() -> Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let runner = ThreadTaskRunner::<UnixTaskRunner>::create_and_start("rl-drop")?;

        for _ in 0..100 {
            let counter = counter.clone();
            runner.post_task(Task::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }
        runner.post_task_and_wait_for_testing(Task::new(|| {}));
        drop(runner);

        assert_eq!(counter.load(Ordering::Relaxed), 100);
        Ok(())
    }

    #[test]
    fn test_drop_right_after_start() -> Result<()> {
        // The quit may land before the thread entered run().
        for _ in 0..10 {
            drop(ThreadTaskRunner::<LockFreeTaskRunner>::create_and_start("rl-quick")?);
        }
        Ok(())
    }

    #[test]
    fn test_custom_stack_size() -> Result<()> {
        let runner = Builder::new()
            .thread_stack_size(1 << 20)
            .try_spawn::<UnixTaskRunner>()?;

        let ran = Arc::new(AtomicUsize::new(0));
        runner.post_task_and_wait_for_testing(Task::new({
            let ran = ran.clone();
            move || {
                ran.fetch_add(1, Ordering::Relaxed);
            }
        }));

        assert_eq!(ran.load(Ordering::Relaxed), 1);
        Ok(())
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn drop_releases_pending_tasks<R: RunLoop>() -> Result<()> {
        let dropped = Arc::new(AtomicBool::new(false));
        let runner = ThreadTaskRunner::<R>::create_and_start("rl-pending")?;

        // Never due, and keeps the runner alive for as long as it is queued.
        let handle = runner.runner().clone();
        let flag = DropFlag(dropped.clone());
        runner.post_delayed_task(
            Task::new(move || {
                let _ = (&handle, &flag);
            }),
            Duration::from_secs(3600),
        );
        drop(runner);

        assert!(dropped.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_drop_releases_pending_tasks_lock_free() -> Result<()> {
        drop_releases_pending_tasks::<LockFreeTaskRunner>()
    }

    #[test]
    fn test_drop_releases_pending_tasks_unix() -> Result<()> {
        drop_releases_pending_tasks::<UnixTaskRunner>()
    }

    #[test]
    #[should_panic(expected = "runner thread dropped the task without running it")]
    fn test_wait_after_quit_panics() {
        let runner = ThreadTaskRunner::<LockFreeTaskRunner>::create_and_start("rl-quit")
            .expect("runner");

        runner.quit();
        runner.post_task_and_wait_for_testing(Task::new(|| {}));
    }
}
