//! Task runner guarding all of its state with one mutex.
//!
//! Simpler than [`crate::LockFreeTaskRunner`] and with the same observable
//! behavior: any thread may mutate the queues and the watch table directly
//! under the lock. Producers contend with each other and with the runner
//! thread.

use crate::platform::{DefaultPoller, Poller};
use crate::runner::{RunEpoch, RunLoop, RunnerConfig, TaskRunner};
use crate::task::Task;
use crate::time::{Clock, DelayedTasks};
use crate::utils::ScopeGuard;
use crate::watch::{Generation, WatchCallback, WatchTable};
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::mem;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Clone)]
pub struct UnixTaskRunner(Arc<Inner>);

struct Inner {
    cfg: RunnerConfig,

    owner: ThreadId,

    clock: Clock,

    poller: DefaultPoller,

    // Runner thread only.
    quit: AtomicBool,

    running: AtomicBool,

    epoch: RunEpoch,

    state: Mutex<State>,
}

struct State {
    immediate: VecDeque<Task>,
    delayed: DelayedTasks,
    watches: WatchTable,

    // Set by `shutdown()`, everything posted afterwards is dropped.
    closed: bool,
}

impl Inner {
    fn on_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    #[track_caller]
    fn assert_on_owner_thread(&self) {
        assert!(
            self.on_owner_thread(),
            "must be called on the thread that created the task runner"
        );
    }

    // The runner thread picks up changes on its next iteration, other
    // threads have to interrupt a wait that may not know about them yet.
    fn wake_if_off_thread(&self) {
        if !self.on_owner_thread() {
            self.poller.wake();
        }
    }

    // Applies `f` unless the runner was shut down. The closure and whatever
    // it captures is dropped outside the lock either way.
    fn with_open_state<F>(&self, f: F)
    where
        F: FnOnce(&mut State),
    {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            trace!("dropping work posted after shutdown");
            drop(f);
            return;
        }

        f(&mut state);
        drop(state);
        self.wake_if_off_thread();
    }
}

impl UnixTaskRunner {
    // Promotes expired delayed tasks, pops one task, waits and dispatches the
    // ready watches. The wait happens on a copy of the poll array so other
    // threads can take the lock meanwhile.
    fn run_once(&self, pollfds: &mut Vec<libc::pollfd>) {
        let inner = &*self.0;

        let (task, timeout) = {
            let mut state = inner.state.lock();
            let State {
                immediate,
                delayed,
                watches,
                ..
            } = &mut *state;

            let now = inner.clock.now();
            while let Some(task) = delayed.pop_expired(now) {
                immediate.push_back(task);
            }

            let task = immediate.pop_front();
            let timeout = match task {
                Some(_) => Some(Duration::ZERO),
                None => delayed.delay_to_next(now),
            };

            pollfds.clear();
            pollfds.extend_from_slice(watches.prepare(inner.poller.wakeup_fd()));

            (task, timeout)
        };

        if let Err(e) = inner.poller.wait(pollfds, timeout) {
            panic!("FATAL: waiting on {} fds failed: {e}", pollfds.len());
        }

        if WatchTable::wakeup_signalled(pollfds) {
            inner.poller.clear_wakeup();
        }

        let ready = WatchTable::ready_fds(pollfds);
        if !ready.is_empty() {
            let mut state = inner.state.lock();
            for fd in ready {
                if let Some(generation) = state.watches.mark_pending(fd) {
                    let task = self.watch_task(fd, generation);
                    state.immediate.push_back(task);
                }
            }
        }

        if let Some(task) = task {
            task.run_guarded(inner.cfg.slow_task_threshold);
        }
    }

    fn watch_task(&self, fd: RawFd, generation: Generation) -> Task {
        let weak: Weak<Inner> = Arc::downgrade(&self.0);

        Task::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };

            let callback = inner.state.lock().watches.begin_callback(fd, generation);
            if let Some(mut callback) = callback {
                callback.call();
                inner
                    .state
                    .lock()
                    .watches
                    .end_callback(fd, generation, callback);
            }
        })
    }
}

impl TaskRunner for UnixTaskRunner {
    fn post_task(&self, task: Task) {
        self.0.with_open_state(move |state| state.immediate.push_back(task));
    }

    fn post_delayed_task(&self, task: Task, delay: Duration) {
        let due = self.0.clock.deadline(delay);
        self.0.with_open_state(move |state| state.delayed.insert(due, task));
    }

    #[track_caller]
    fn add_file_descriptor_watch(&self, fd: RawFd, callback: WatchCallback) {
        let mut state = self.0.state.lock();
        if !state.closed {
            state.watches.add(fd, callback);
            drop(state);
            self.0.wake_if_off_thread();
        }
    }

    #[track_caller]
    fn remove_file_descriptor_watch(&self, fd: RawFd) {
        let mut state = self.0.state.lock();
        if !state.closed {
            state.watches.remove(fd);
            drop(state);
            self.0.wake_if_off_thread();
        }
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        self.0.on_owner_thread()
    }
}

impl RunLoop for UnixTaskRunner {
    fn with_config(cfg: RunnerConfig) -> Result<Self> {
        let poller = DefaultPoller::try_new()?;

        debug!(?cfg, "creating unix task runner");

        Ok(UnixTaskRunner(Arc::new(Inner {
            cfg,
            owner: thread::current().id(),
            clock: Clock::new(),
            poller,
            quit: AtomicBool::new(false),
            running: AtomicBool::new(false),
            epoch: RunEpoch::new(),
            state: Mutex::new(State {
                immediate: VecDeque::new(),
                delayed: DelayedTasks::new(),
                watches: WatchTable::new(),
                closed: false,
            }),
        })))
    }

    #[track_caller]
    fn run(&self) {
        let inner = &*self.0;
        inner.assert_on_owner_thread();
        assert!(
            !inner.running.swap(true, Ordering::Relaxed),
            "run() must not be nested"
        );
        assert!(!inner.state.lock().closed, "run() called after shutdown()");

        inner.quit.store(false, Ordering::Relaxed);
        inner.epoch.enter();
        let _running = ScopeGuard::new(|| {
            inner.epoch.exit();
            inner.running.store(false, Ordering::Relaxed);
        });

        debug!("run loop started");
        let mut pollfds = Vec::new();
        while !inner.quit.load(Ordering::Relaxed) {
            self.run_once(&mut pollfds);
        }
        debug!("run loop quit");
    }

    fn quit(&self) {
        let inner = &self.0;
        if inner.on_owner_thread() {
            inner.quit.store(true, Ordering::Relaxed);
            return;
        }

        // Queued behind everything posted so far.
        let target = inner.epoch.quit_target();
        let weak = Arc::downgrade(inner);
        let task = Task::new(move || {
            if let Some(inner) = weak.upgrade() {
                if inner.epoch.is_current(target) {
                    inner.quit.store(true, Ordering::Relaxed);
                } else {
                    trace!("ignoring quit meant for an earlier run");
                }
            }
        });
        inner.with_open_state(move |state| state.immediate.push_back(task));
    }

    #[track_caller]
    fn shutdown(&self) {
        let inner = &*self.0;
        inner.assert_on_owner_thread();
        assert!(
            !inner.running.load(Ordering::Relaxed),
            "shutdown() must not be called from a task"
        );

        // Dropped outside the lock, destructors may call back into us.
        let (immediate, delayed, watches) = {
            let mut state = inner.state.lock();
            state.closed = true;
            (
                mem::take(&mut state.immediate),
                mem::replace(&mut state.delayed, DelayedTasks::new()),
                mem::replace(&mut state.watches, WatchTable::new()),
            )
        };

        debug!(
            num_tasks = immediate.len(),
            num_delayed = delayed.len(),
            num_watches = watches.len(),
            "task runner shut down"
        );
    }

    #[track_caller]
    fn is_idle_for_testing(&self) -> bool {
        self.0.assert_on_owner_thread();
        self.0.state.lock().immediate.is_empty()
    }

    fn advance_time_for_testing(&self, delta: Duration) {
        self.0.clock.advance(delta);
        self.0.poller.wake();
    }
}

impl fmt::Debug for UnixTaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock();

        f.debug_struct("UnixTaskRunner")
            .field("owner", &self.0.owner)
            .field("immediate", &state.immediate.len())
            .field("delayed", &state.delayed)
            .field("watches", &state.watches)
            .finish_non_exhaustive()
    }
}
