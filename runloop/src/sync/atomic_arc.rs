use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Number of in-flight loader counters. Must be a power of two.
pub(crate) const NUM_LOADER_BUCKETS: usize = 32;

const _: () = assert!(NUM_LOADER_BUCKETS.is_power_of_two());

/// An atomically swappable `Option<Arc<T>>`.
///
/// While non-empty, the slot owns exactly one strong count of the `Arc` it
/// points to. The hard part is `load()`: between reading the raw pointer and
/// bumping its strong count, another thread may swap the slot and drop what
/// could be the last reference. Loaders therefore announce themselves in a
/// hashed in-flight counter before re-validating the slot, and whoever is
/// about to give up the final reference of a value that used to live in the
/// slot must first observe [`AtomicArc::is_quiescent`].
///
/// All operations on the pointer and the loader counters are `SeqCst`: the
/// quiescence argument needs a single total order between "loader announced"
/// and "owner checked".
pub(crate) struct AtomicArc<T> {
    ptr: AtomicPtr<T>,

    loaders: [AtomicUsize; NUM_LOADER_BUCKETS],

    _marker: PhantomData<Option<Arc<T>>>,
}

// Safety: the slot behaves like an `Option<Arc<T>>` shared between threads,
// which is `Send + Sync` exactly when `T: Send + Sync`.
unsafe impl<T: Send + Sync> Send for AtomicArc<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicArc<T> {}

impl<T> AtomicArc<T> {
    pub(crate) fn new(value: Option<Arc<T>>) -> Self {
        Self {
            ptr: AtomicPtr::new(into_raw(value)),
            loaders: std::array::from_fn(|_| AtomicUsize::new(0)),
            _marker: PhantomData,
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(None)
    }

    /// Returns a new strong reference to the current value.
    pub(crate) fn load(&self) -> Option<Arc<T>> {
        loop {
            let raw = self.ptr.load(Ordering::SeqCst);
            if raw.is_null() {
                return None;
            }

            let bucket = &self.loaders[bucket_of(raw)];
            bucket.fetch_add(1, Ordering::SeqCst);

            // Re-validate now that we are visible to the owner side. If the
            // slot still holds `raw`, its strong count cannot be released
            // before the owner sees our bucket drain.
            if self.ptr.load(Ordering::SeqCst) == raw {
                // Safety: `raw` came from `Arc::into_raw` and is kept alive
                // by the slot or by an owner waiting on our bucket.
                let arc = unsafe {
                    Arc::increment_strong_count(raw);
                    Arc::from_raw(raw)
                };
                bucket.fetch_sub(1, Ordering::Release);
                return Some(arc);
            }

            bucket.fetch_sub(1, Ordering::Release);
        }
    }

    /// Replaces the value, returning the reference previously owned by the
    /// slot.
    ///
    /// Only use this on slots that are never `load()`ed, or hand the result
    /// to a caller that checks [`AtomicArc::is_quiescent`] before dropping it.
    pub(crate) fn swap(&self, value: Option<Arc<T>>) -> Option<Arc<T>> {
        let prev = self.ptr.swap(into_raw(value), Ordering::SeqCst);

        // Safety: the slot owned one strong count of `prev`, we take it over.
        unsafe { from_raw(prev) }
    }

    /// Installs `new` if the slot currently holds `current`.
    ///
    /// On success, returns the strong count the slot used to own (which
    /// points to the same allocation as `current`). Because the caller holds
    /// `current`, dropping that returned reference can never free the value.
    /// On failure, hands `new` back untouched.
    pub(crate) fn compare_exchange(
        &self,
        current: Option<&Arc<T>>,
        new: Option<Arc<T>>,
    ) -> Result<Option<Arc<T>>, Option<Arc<T>>> {
        let current = current.map_or(ptr::null_mut(), |arc| Arc::as_ptr(arc).cast_mut());
        let new = into_raw(new);

        match self
            .ptr
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            // Safety: on success the slot's strong count of `prev` is ours.
            Ok(prev) => Ok(unsafe { from_raw(prev) }),
            // Safety: `new` was never published, we still own its count.
            Err(_) => Err(unsafe { from_raw(new) }),
        }
    }

    /// Whether the slot currently points to `value`.
    #[cfg(test)]
    pub(crate) fn holds(&self, value: &Arc<T>) -> bool {
        ptr::eq(self.ptr.load(Ordering::SeqCst), Arc::as_ptr(value))
    }

    /// True when no `load()` can be racing to take a reference to `value`.
    ///
    /// Only meaningful once `value` is no longer held by the slot: any loader
    /// that announces itself after this returns true will fail re-validation.
    /// Buckets are shared, so a false result may be spurious.
    pub(crate) fn is_quiescent(&self, value: &Arc<T>) -> bool {
        self.loaders[bucket_of(Arc::as_ptr(value))].load(Ordering::SeqCst) == 0
    }

    #[cfg(test)]
    pub(crate) fn into_inner(mut self) -> Option<Arc<T>> {
        let raw = std::mem::replace(self.ptr.get_mut(), ptr::null_mut());

        // Safety: we have exclusive access and take over the slot's count.
        unsafe { from_raw(raw) }
    }
}

impl<T> Drop for AtomicArc<T> {
    fn drop(&mut self) {
        let raw = std::mem::replace(self.ptr.get_mut(), ptr::null_mut());

        // Safety: exclusive access, the slot owned one strong count.
        drop(unsafe { from_raw(raw) });
    }
}

impl<T> fmt::Debug for AtomicArc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicArc")
            .field("ptr", &self.ptr.load(Ordering::Relaxed))
            .finish()
    }
}

/// Maps a pointer to a loader bucket. Allocations are at least 8 byte
/// aligned and usually much more, so mix the address instead of masking
/// its low bits.
pub(crate) fn bucket_of<T>(raw: *const T) -> usize {
    const FIBONACCI: u64 = 0x9E37_79B9_7F4A_7C15;
    let hash = (raw as usize as u64).wrapping_mul(FIBONACCI);
    (hash >> (u64::BITS - NUM_LOADER_BUCKETS.trailing_zeros())) as usize
}

fn into_raw<T>(value: Option<Arc<T>>) -> *mut T {
    value.map_or(ptr::null_mut(), |arc| Arc::into_raw(arc).cast_mut())
}

/// # Safety
///
/// `raw` must be null or carry one strong count the caller now owns.
unsafe fn from_raw<T>(raw: *mut T) -> Option<Arc<T>> {
    if raw.is_null() {
        None
    } else {
        Some(unsafe { Arc::from_raw(raw) })
    }
}
