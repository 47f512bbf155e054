//! File descriptor readiness watches.

use crate::runner::SPILL_TO_HEAP_THRESHOLD;
use bitflags::bitflags;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::RawFd;
use tracing::trace;

/// Callback invoked on the runner thread every time a watched file
/// descriptor becomes ready.
pub struct WatchCallback(Box<dyn FnMut() + Send + 'static>);

impl WatchCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        WatchCallback(Box::new(f))
    }

    pub(crate) fn call(&mut self) {
        (self.0)()
    }
}

impl fmt::Debug for WatchCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WatchCallback").field(&"<closure>").finish()
    }
}

impl<F> From<F> for WatchCallback
where
    F: FnMut() + Send + 'static,
{
    fn from(f: F) -> Self {
        WatchCallback::new(f)
    }
}

bitflags! {
    /// Poll events that make a watch fire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Readiness: libc::c_short {
        /// Data to read.
        const READABLE = libc::POLLIN;

        /// Peer closed its end, e.g. the write end of a pipe.
        const HANGUP = libc::POLLHUP;

        const ERROR = libc::POLLERR;
    }
}

impl Readiness {
    pub(crate) fn from_revents(revents: libc::c_short) -> Self {
        Readiness::from_bits_truncate(revents)
    }
}

struct WatchEntry {
    // Taken out while the callback runs.
    callback: Option<WatchCallback>,

    // Index into `pollfds`, only valid while the table is not dirty.
    poll_index: usize,

    // A callback task was posted and has not run yet.
    pending: bool,

    generation: Generation,
}

/// Identifies one registration of a file descriptor. Removing and adding
/// the same fd again yields a new generation.
pub(crate) type Generation = u64;

/// Watched fds and the `pollfd` array derived from them. Owned by the
/// runner thread.
///
/// `pollfds[0]` is always the runner's wakeup handle. Pending fds stay in
/// the array with a negated fd, which `poll(2)` skips.
pub(crate) struct WatchTable {
    entries: BTreeMap<RawFd, WatchEntry>,

    pollfds: Vec<libc::pollfd>,

    dirty: bool,

    next_generation: Generation,
}

impl WatchTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            pollfds: Vec::new(),
            dirty: true,
            next_generation: 0,
        }
    }

    #[track_caller]
    pub(crate) fn add(&mut self, fd: RawFd, callback: WatchCallback) {
        assert!(fd >= 0, "invalid fd {fd}");

        let generation = self.next_generation;
        self.next_generation += 1;

        let prev = self.entries.insert(
            fd,
            WatchEntry {
                callback: Some(callback),
                poll_index: 0,
                pending: false,
                generation,
            },
        );
        assert!(prev.is_none(), "fd {fd} is already watched");

        self.dirty = true;
    }

    #[track_caller]
    pub(crate) fn remove(&mut self, fd: RawFd) {
        let removed = self.entries.remove(&fd);
        assert!(removed.is_some(), "fd {fd} is not watched");

        self.dirty = true;
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, fd: RawFd) -> bool {
        self.entries.contains_key(&fd)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the array to hand to `poll(2)`, rebuilding it if watches were
    /// added or removed since the last call.
    pub(crate) fn prepare(&mut self, wakeup_fd: RawFd) -> &mut [libc::pollfd] {
        if self.dirty {
            self.rebuild(wakeup_fd);
        }

        &mut self.pollfds
    }

    fn rebuild(&mut self, wakeup_fd: RawFd) {
        self.pollfds.clear();
        self.pollfds.push(pollfd(wakeup_fd));

        for (fd, entry) in self.entries.iter_mut() {
            entry.poll_index = self.pollfds.len();
            let fd = if entry.pending { !*fd } else { *fd };
            self.pollfds.push(pollfd(fd));
        }

        self.dirty = false;
        trace!(watches = self.entries.len(), "rebuilt poll array");
    }

    /// Whether the wait on `pollfds` reported the wakeup handle as readable.
    pub(crate) fn wakeup_signalled(pollfds: &[libc::pollfd]) -> bool {
        pollfds
            .first()
            .is_some_and(|pfd| !Readiness::from_revents(pfd.revents).is_empty())
    }

    /// Watched fds the wait on `pollfds` reported ready. `pollfds` is the
    /// array returned by [`WatchTable::prepare`], or a copy of it.
    pub(crate) fn ready_fds(pollfds: &[libc::pollfd]) -> SmallVec<[RawFd; SPILL_TO_HEAP_THRESHOLD]> {
        pollfds
            .iter()
            .skip(1)
            .filter(|pfd| pfd.fd >= 0 && !Readiness::from_revents(pfd.revents).is_empty())
            .map(|pfd| pfd.fd)
            .collect()
    }

    /// Excludes `fd` from the next waits until its callback ran. Returns the
    /// registration to hand back to [`WatchTable::begin_callback`], or `None`
    /// if `fd` is gone or already pending.
    pub(crate) fn mark_pending(&mut self, fd: RawFd) -> Option<Generation> {
        let entry = self.entries.get_mut(&fd)?;
        if entry.pending {
            return None;
        }

        entry.pending = true;
        if !self.dirty {
            self.pollfds[entry.poll_index].fd = !fd;
        }

        Some(entry.generation)
    }

    /// Re-admits `fd` into the wait set and lends out its callback. Returns
    /// `None` if the registration was removed or replaced in the meantime.
    pub(crate) fn begin_callback(
        &mut self,
        fd: RawFd,
        generation: Generation,
    ) -> Option<WatchCallback> {
        let entry = self
            .entries
            .get_mut(&fd)
            .filter(|entry| entry.generation == generation)?;

        entry.pending = false;
        if !self.dirty {
            self.pollfds[entry.poll_index].fd = fd;
        }

        entry.callback.take()
    }

    /// Gives the callback back, unless the callback removed its own watch.
    pub(crate) fn end_callback(
        &mut self,
        fd: RawFd,
        generation: Generation,
        callback: WatchCallback,
    ) {
        if let Some(entry) = self
            .entries
            .get_mut(&fd)
            .filter(|entry| entry.generation == generation)
        {
            debug_assert!(entry.callback.is_none());
            entry.callback = Some(callback);
        }
    }
}

impl fmt::Debug for WatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchTable")
            .field("fds", &self.entries.keys().collect::<Vec<_>>())
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

fn pollfd(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}
