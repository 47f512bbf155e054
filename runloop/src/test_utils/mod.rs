use anyhow::{Result, anyhow};
use nix::sys::eventfd::{EfdFlags, EventFd as NixEventFd};
use std::ffi::CStr;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Once;
use tracing_subscriber::EnvFilter;

const MAX_PTHREAD_NAME_LEN: usize = 16;

/// Installs a test-friendly subscriber once per process. Filter with
/// `RUST_LOG`, e.g. `RUST_LOG=runloop=trace`.
pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Non-blocking eventfd used to drive watches from tests.
#[derive(Debug)]
pub(crate) struct EventFd(NixEventFd);

impl EventFd {
    pub(crate) fn new() -> Self {
        let fd = NixEventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .expect("failed to create eventfd");
        EventFd(fd)
    }

    pub(crate) fn notify(&self) {
        self.0.write(1).expect("eventfd write failed");
    }

    pub(crate) fn clear(&self) {
        // EAGAIN when not notified.
        let _ = self.0.read();
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

/// Returns `(read end, write end)` of a new pipe.
pub(crate) fn pipe() -> Result<(File, File)> {
    let (rd, wr) = nix::unistd::pipe()?;
    Ok((File::from(rd), File::from(wr)))
}

/// Gets the name of the current thread as the kernel sees it.
///
/// This uses `pthread_getname_np` on Linux, which is the counterpart
/// to `pthread_setname_np`.
pub(crate) fn get_current_thread_name() -> Result<String> {
    // It's initialized to zeros, so it's guaranteed to be null-terminated.
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        let thread = libc::pthread_self();
        libc::pthread_getname_np(thread, c_name_buf.as_mut_ptr(), MAX_PTHREAD_NAME_LEN)
    };

    if ret != 0 {
        return Err(anyhow!(
            "pthread_getname_np failed with error code: {}",
            ret
        ));
    }

    let c_str = unsafe { CStr::from_ptr(c_name_buf.as_ptr()) };
    c_str
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| anyhow!("Failed to convert thread name from CStr: {}", e))
}
