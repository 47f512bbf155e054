//! Blocking wait on a set of file descriptors, plus the wakeup handle used
//! to interrupt it from other threads.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

mod unix;
pub(crate) use unix::UnixPoller;

/// The poller used by the runners on this platform.
pub(crate) type DefaultPoller = UnixPoller;

pub(crate) trait Poller: Send + Sync {
    /// Makes a concurrent or upcoming [`Poller::wait`] return. Callable from
    /// any thread.
    fn wake(&self);

    /// Resets the wakeup handle after a wait reported it readable.
    fn clear_wakeup(&self);

    /// The fd to put at the front of every wait set.
    fn wakeup_fd(&self) -> RawFd;

    /// Blocks until one of `pollfds` is ready or `timeout` elapses. `None`
    /// waits forever. Interrupted waits are retried.
    fn wait(&self, pollfds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize>;
}
