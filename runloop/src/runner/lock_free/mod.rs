//! Task runner whose immediate queue is a lock-free slab chain.
//!
//! Producers on any thread append to the chain without taking a lock. The
//! delayed tasks and the watch table belong to the runner thread. Other
//! threads touching them post a task that applies the change on the runner
//! thread instead.

use crate::platform::{DefaultPoller, Poller};
use crate::runner::{RunEpoch, RunLoop, RunnerConfig, TaskRunner};
use crate::task::Task;
use crate::time::{Clock, DelayedTasks};
use crate::utils::ScopeGuard;
use crate::watch::{Generation, WatchCallback, WatchTable};
use anyhow::Result;
use std::cell::{Cell, RefCell, RefMut};
use std::fmt;
use std::os::fd::RawFd;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, trace};

mod queue;
use queue::SlabChain;

mod slab;

#[derive(Clone)]
pub struct LockFreeTaskRunner(Arc<Inner>);

struct Inner {
    cfg: RunnerConfig,

    owner: ThreadId,

    queue: SlabChain,

    clock: Clock,

    poller: DefaultPoller,

    // Runner thread only.
    quit: AtomicBool,

    epoch: RunEpoch,

    // Set by `shutdown()`, everything posted afterwards is dropped.
    closed: AtomicBool,

    // Producers between their `closed` check and the end of their push.
    posting: AtomicUsize,

    // Runner thread only.
    consumer: RefCell<Consumer>,

    // Runner thread only.
    running: Cell<bool>,
}

struct Consumer {
    delayed: DelayedTasks,
    watches: WatchTable,
}

// Safety: `consumer` and `running` are only accessed through
// `Inner::consumer()` and `LockFreeTaskRunner::run()`, which both assert they
// are on the `owner` thread. Everything else is `Sync`.
unsafe impl Sync for Inner {}

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

    #[track_caller]
    fn consumer(&self) -> RefMut<'_, Consumer> {
        self.assert_on_owner_thread();
        self.consumer.borrow_mut()
    }

    fn post(&self, task: Task) {
        // Pairs with `shutdown()`: either we see `closed`, or it waits for
        // our push to land before draining.
        self.posting.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.posting.fetch_sub(1, Ordering::SeqCst);
            trace!("dropping task posted after shutdown");
            return;
        }

        self.queue.push(task);
        self.posting.fetch_sub(1, Ordering::SeqCst);

        if !self.on_owner_thread() {
            self.poller.wake();
        }
    }

    // Applies `f` on the runner thread: right away if we are on it, through
    // the queue otherwise. Dropped if the runner is gone by then.
    fn on_runner_thread<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(&Inner) + Send + 'static,
    {
        if self.on_owner_thread() {
            if !self.closed.load(Ordering::Relaxed) {
                f(&**self);
            }
            return;
        }

        let weak = Arc::downgrade(self);
        self.post(Task::new(move || {
            if let Some(inner) = weak.upgrade() {
                f(&*inner);
            }
        }));
    }
}

impl LockFreeTaskRunner {
    /// Slabs allocated from the heap since the runner was created.
    pub fn slabs_allocated(&self) -> usize {
        self.0.queue.slabs_allocated()
    }

    /// Slabs handed back to the heap since the runner was created.
    pub fn slabs_freed(&self) -> usize {
        self.0.queue.slabs_freed()
    }

    fn run_once(&self) {
        let inner = &*self.0;

        let now = inner.clock.now();
        {
            let mut consumer = inner.consumer();
            while let Some(task) = consumer.delayed.pop_expired(now) {
                inner.queue.push(task);
            }
        }

        // Safety: `run()` asserted we are on the owner thread.
        let task = unsafe { inner.queue.pop() };

        {
            let mut consumer = inner.consumer();
            let Consumer { delayed, watches } = &mut *consumer;

            // Still poll when a task is ready so busy queues don't starve
            // the watches.
            let timeout = match task {
                Some(_) => Some(Duration::ZERO),
                None => delayed.delay_to_next(inner.clock.now()),
            };

            let pollfds = watches.prepare(inner.poller.wakeup_fd());
            if let Err(e) = inner.poller.wait(pollfds, timeout) {
                panic!("FATAL: waiting on {} fds failed: {e}", pollfds.len());
            }

            // The wakeup handle is never dispatched as a task, that would
            // wake us up again for every task we post.
            if WatchTable::wakeup_signalled(pollfds) {
                inner.poller.clear_wakeup();
            }

            for fd in WatchTable::ready_fds(pollfds) {
                if let Some(generation) = watches.mark_pending(fd) {
                    inner.queue.push(self.watch_task(fd, generation));
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

            // Don't hold the borrow while the callback runs, it may add or
            // remove watches.
            let callback = inner.consumer().watches.begin_callback(fd, generation);
            if let Some(mut callback) = callback {
                callback.call();
                inner
                    .consumer()
                    .watches
                    .end_callback(fd, generation, callback);
            }
        })
    }
}

impl TaskRunner for LockFreeTaskRunner {
    fn post_task(&self, task: Task) {
        self.0.post(task);
    }

    fn post_delayed_task(&self, task: Task, delay: Duration) {
        let due = self.0.clock.deadline(delay);
        self.0
            .on_runner_thread(move |inner| inner.consumer().delayed.insert(due, task));
    }

    fn add_file_descriptor_watch(&self, fd: RawFd, callback: WatchCallback) {
        self.0
            .on_runner_thread(move |inner| inner.consumer().watches.add(fd, callback));
    }

    fn remove_file_descriptor_watch(&self, fd: RawFd) {
        self.0
            .on_runner_thread(move |inner| inner.consumer().watches.remove(fd));
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        self.0.on_owner_thread()
    }
}

impl RunLoop for LockFreeTaskRunner {
    fn with_config(cfg: RunnerConfig) -> Result<Self> {
        let poller = DefaultPoller::try_new()?;
        let queue = SlabChain::new(cfg.preallocate_free_slab);

        debug!(?cfg, "creating lock-free task runner");

        Ok(LockFreeTaskRunner(Arc::new(Inner {
            cfg,
            owner: thread::current().id(),
            queue,
            clock: Clock::new(),
            poller,
            quit: AtomicBool::new(false),
            epoch: RunEpoch::new(),
            closed: AtomicBool::new(false),
            posting: AtomicUsize::new(0),
            consumer: RefCell::new(Consumer {
                delayed: DelayedTasks::new(),
                watches: WatchTable::new(),
            }),
            running: Cell::new(false),
        })))
    }

    #[track_caller]
    fn run(&self) {
        let inner = &*self.0;
        inner.assert_on_owner_thread();
        assert!(!inner.running.replace(true), "run() must not be nested");
        assert!(
            !inner.closed.load(Ordering::Relaxed),
            "run() called after shutdown()"
        );

        inner.quit.store(false, Ordering::Relaxed);
        inner.epoch.enter();
        let _running = ScopeGuard::new(|| {
            inner.epoch.exit();
            inner.running.set(false);
        });

        debug!("run loop started");
        while !inner.quit.load(Ordering::Relaxed) {
            self.run_once();
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
        inner.post(Task::new(move || {
            if let Some(inner) = weak.upgrade() {
                if inner.epoch.is_current(target) {
                    inner.quit.store(true, Ordering::Relaxed);
                } else {
                    trace!("ignoring quit meant for an earlier run");
                }
            }
        }));
    }

    #[track_caller]
    fn shutdown(&self) {
        let inner = &*self.0;
        inner.assert_on_owner_thread();
        assert!(!inner.running.get(), "shutdown() must not be called from a task");

        inner.closed.store(true, Ordering::SeqCst);
        while inner.posting.load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }

        // Dropped outside the borrow, destructors may call back into us.
        let (delayed, watches) = {
            let mut consumer = inner.consumer();
            (
                mem::replace(&mut consumer.delayed, DelayedTasks::new()),
                mem::replace(&mut consumer.watches, WatchTable::new()),
            )
        };
        let (num_delayed, num_watches) = (delayed.len(), watches.len());
        drop(delayed);
        drop(watches);

        let mut num_tasks = 0;
        // Safety: checked above.
        while let Some(task) = unsafe { inner.queue.pop() } {
            drop(task);
            num_tasks += 1;
        }

        debug!(num_tasks, num_delayed, num_watches, "task runner shut down");
    }

    #[track_caller]
    fn is_idle_for_testing(&self) -> bool {
        self.0.assert_on_owner_thread();

        // Safety: checked above.
        unsafe { self.0.queue.is_idle() }
    }

    fn advance_time_for_testing(&self, delta: Duration) {
        self.0.clock.advance(delta);
        self.0.poller.wake();
    }
}

impl fmt::Debug for LockFreeTaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeTaskRunner")
            .field("owner", &self.0.owner)
            .field("queue", &self.0.queue)
            .field("poller", &self.0.poller)
            .field("quit", &self.0.quit.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
