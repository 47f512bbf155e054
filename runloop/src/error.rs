use std::io;

/// Errors surfaced while setting up a runner. Everything that goes wrong
/// once a runner is up is a contract violation and panics instead.
#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    /// The eventfd or socket pair used to interrupt the wait could not be
    /// created, typically because the process ran out of file descriptors.
    #[error("Failed to create the wakeup handle: {0}")]
    Wakeup(#[source] io::Error),

    #[error("Failed to spawn the runner thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    /// The runner thread died before handing its runner over.
    #[error("Runner thread exited before the runner was ready")]
    ThreadExited,
}

impl RunnerError {
    /// Running out of descriptors may resolve itself, the rest won't.
    pub fn is_retryable(&self) -> bool {
        match self {
            RunnerError::Wakeup(e) | RunnerError::ThreadSpawn(e) => e
                .raw_os_error()
                .is_some_and(|errno| matches!(errno, libc::EMFILE | libc::ENFILE | libc::EAGAIN)),
            RunnerError::ThreadExited => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(RunnerError: Send, Sync, std::error::Error);

    #[rstest]
    #[case::fd_limit(RunnerError::Wakeup(io::Error::from_raw_os_error(libc::EMFILE)), true)]
    #[case::no_memory(RunnerError::Wakeup(io::Error::from_raw_os_error(libc::ENOMEM)), false)]
    #[case::thread_limit(RunnerError::ThreadSpawn(io::Error::from_raw_os_error(libc::EAGAIN)), true)]
    #[case::exited(RunnerError::ThreadExited, false)]
    fn test_is_retryable(#[case] err: RunnerError, #[case] expected: bool) {
        assert_eq!(err.is_retryable(), expected);
    }

    #[test]
    fn test_converts_to_anyhow() {
        let err: anyhow::Error = RunnerError::ThreadExited.into();
        assert!(err.downcast_ref::<RunnerError>().is_some());
    }
}
