use crate::error::RunnerError;
use crate::platform::Poller;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

#[cfg(target_os = "linux")]
use nix::sys::eventfd::{EfdFlags, EventFd};

#[cfg(not(target_os = "linux"))]
use std::os::unix::net::UnixStream;

/// `poll(2)` based poller.
///
/// The wakeup handle is an eventfd on Linux and a non-blocking socket pair
/// elsewhere.
pub(crate) struct UnixPoller {
    wakeup: Wakeup,
}

impl UnixPoller {
    pub(crate) fn try_new() -> Result<Self, RunnerError> {
        Ok(Self {
            wakeup: Wakeup::try_new().map_err(RunnerError::Wakeup)?,
        })
    }
}

impl Poller for UnixPoller {
    fn wake(&self) {
        self.wakeup.notify();
    }

    fn clear_wakeup(&self) {
        self.wakeup.clear();
    }

    fn wakeup_fd(&self) -> RawFd {
        self.wakeup.fd()
    }

    fn wait(&self, pollfds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout_to_ms(timeout);

        loop {
            let ret = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };

            if ret >= 0 {
                return Ok(ret as usize);
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl fmt::Debug for UnixPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnixPoller")
            .field("wakeup_fd", &self.wakeup_fd())
            .finish()
    }
}

/// Milliseconds for `poll(2)`, rounded up so a sub-millisecond delay does
/// not turn into a busy loop. `-1` blocks forever.
fn timeout_to_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            let ms = timeout.as_nanos().div_ceil(1_000_000);
            libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
        }
    }
}

#[cfg(target_os = "linux")]
struct Wakeup(EventFd);

#[cfg(target_os = "linux")]
impl Wakeup {
    fn try_new() -> io::Result<Self> {
        let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(Wakeup(fd))
    }

    fn notify(&self) {
        // EAGAIN means the counter is saturated, the fd is readable anyway.
        let _ = self.0.write(1);
    }

    fn clear(&self) {
        // EAGAIN means somebody cleared it already.
        let _ = self.0.read();
    }

    fn fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

#[cfg(not(target_os = "linux"))]
struct Wakeup {
    rx: UnixStream,
    tx: UnixStream,
}

#[cfg(not(target_os = "linux"))]
impl Wakeup {
    fn try_new() -> io::Result<Self> {
        let (rx, tx) = UnixStream::pair()?;
        rx.set_nonblocking(true)?;
        tx.set_nonblocking(true)?;
        Ok(Wakeup { rx, tx })
    }

    fn notify(&self) {
        use std::io::Write;

        // A full socket buffer is as good as a successful write.
        let _ = (&self.tx).write(&[1]);
    }

    fn clear(&self) {
        use std::io::Read;

        let mut buf = [0u8; 64];
        while matches!((&self.rx).read(&mut buf), Ok(n) if n > 0) {}
    }

    fn fd(&self) -> RawFd {
        self.rx.as_fd().as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::Readiness;
    use anyhow::Result;
    use rstest::rstest;
    use std::time::Instant;

    fn wakeup_set(poller: &UnixPoller) -> [libc::pollfd; 1] {
        [libc::pollfd {
            fd: poller.wakeup_fd(),
            events: libc::POLLIN,
            revents: 0,
        }]
    }

    #[rstest]
    #[case::infinite(None, -1)]
    #[case::zero(Some(Duration::ZERO), 0)]
    #[case::rounds_up(Some(Duration::from_micros(1)), 1)]
    #[case::exact(Some(Duration::from_millis(250)), 250)]
    #[case::saturates(Some(Duration::from_secs(u64::MAX)), libc::c_int::MAX)]
    fn test_timeout_to_ms(#[case] timeout: Option<Duration>, #[case] expected: libc::c_int) {
        assert_eq!(timeout_to_ms(timeout), expected);
    }

    #[test]
    fn test_wait_times_out() -> Result<()> {
        let poller = UnixPoller::try_new()?;
        let mut pollfds = wakeup_set(&poller);

        let start = Instant::now();
        let ready = poller.wait(&mut pollfds, Some(Duration::from_millis(20)))?;

        assert_eq!(ready, 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
        Ok(())
    }

    #[test]
    fn test_wake_and_clear() -> Result<()> {
        let poller = UnixPoller::try_new()?;

        // Several wakes collapse into one readable state.
        poller.wake();
        poller.wake();

        let mut pollfds = wakeup_set(&poller);
        assert_eq!(poller.wait(&mut pollfds, None)?, 1);
        assert!(Readiness::from_revents(pollfds[0].revents).contains(Readiness::READABLE));

        poller.clear_wakeup();
        let mut pollfds = wakeup_set(&poller);
        assert_eq!(poller.wait(&mut pollfds, Some(Duration::ZERO))?, 0);

        // Clearing twice is harmless.
        poller.clear_wakeup();
        Ok(())
    }

    #[test]
    fn test_wake_from_another_thread() -> Result<()> {
        let poller = std::sync::Arc::new(UnixPoller::try_new()?);
        let waker = {
            let poller = poller.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                poller.wake();
            })
        };

        let mut pollfds = wakeup_set(&poller);
        assert_eq!(poller.wait(&mut pollfds, None)?, 1);

        waker.join().expect("waker panicked");
        Ok(())
    }
}
