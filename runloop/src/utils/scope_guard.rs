/// Runs a closure when it goes out of scope.
///
/// Used wherever consumer-thread bookkeeping must be restored no matter how a
/// scope is left: a normal return, an early return, or a panic unwinding out
/// of a task.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // Wrapped in an `Option` so `drop` can move the closure out and call it
    // exactly once.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    /// Creates an armed guard.
    ///
    /// ```ignore
    /// let running = Cell::new(true);
    /// {
    ///     let _guard = ScopeGuard::new(|| running.set(false));
    ///     assert!(running.get());
    /// }
    /// assert!(!running.get());
    /// ```
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}
