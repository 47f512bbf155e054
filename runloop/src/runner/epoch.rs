use std::sync::atomic::{AtomicU64, Ordering};

/// Counts `run()` invocations so a queued quit only ends the run it was
/// meant for.
///
/// The counter is odd while a run is active and even in between. A run's id
/// is the odd value it set on entry.
#[derive(Debug, Default)]
pub(crate) struct RunEpoch(AtomicU64);

impl RunEpoch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enter(&self) {
        let prev = self.0.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev % 2 == 0, "entered a run that is already active");
    }

    pub(crate) fn exit(&self) {
        let prev = self.0.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev % 2 == 1, "exited a run that is not active");
    }

    /// The run a quit issued now should end: the active one, or else the
    /// next one.
    pub(crate) fn quit_target(&self) -> u64 {
        let epoch = self.0.load(Ordering::SeqCst);
        epoch | 1
    }

    pub(crate) fn is_current(&self, target: u64) -> bool {
        self.0.load(Ordering::SeqCst) == target
    }
}
