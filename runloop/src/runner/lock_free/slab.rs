use crate::task::Task;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Number of task slots per slab.
pub(crate) const SLAB_SIZE: usize = 512;

type BitWord = u64;

const BITS_PER_WORD: usize = BitWord::BITS as usize;

const NUM_WORDS: usize = SLAB_SIZE / BITS_PER_WORD;

const _: () = assert!(SLAB_SIZE.is_power_of_two());
const _: () = assert!(SLAB_SIZE >= BITS_PER_WORD);

/// One link of the slab chain: a fixed array of task slots.
///
/// Producers reserve slots with `next_free_slot`, write the task and then set
/// the matching `published` bit. The consumer scans `published & !consumed`
/// and tracks what it already ran in its private `consumed` bitmap, so
/// producers and the consumer never write the same word.
pub(crate) struct Slab {
    tasks: [UnsafeCell<Option<Task>>; SLAB_SIZE],

    next_free_slot: AtomicUsize,

    published: [AtomicU64; NUM_WORDS],

    // Consumer only.
    consumed: UnsafeCell<[BitWord; NUM_WORDS]>,

    // Consumer only, or exclusive owner before the slab is published as tail.
    prev: UnsafeCell<Option<Arc<Slab>>>,
}

// Safety: every `tasks` slot is written by exactly one producer (the one that
// reserved it) before its `published` bit is set with release ordering, and
// only read by the consumer after an acquire load observed that bit.
// `consumed` and `prev` are only touched by the consumer thread, which the
// `unsafe` accessors below require from their callers.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    /// Creates a slab whose first `reserved` slots already belong to the
    /// caller.
    pub(crate) fn new(prev: Option<Arc<Slab>>, reserved: usize) -> Self {
        debug_assert!(reserved <= SLAB_SIZE);

        Self {
            tasks: std::array::from_fn(|_| UnsafeCell::new(None)),
            next_free_slot: AtomicUsize::new(reserved),
            published: std::array::from_fn(|_| AtomicU64::new(0)),
            consumed: UnsafeCell::new([0; NUM_WORDS]),
            prev: UnsafeCell::new(prev),
        }
    }

    /// Resets a recycled slab so it can be linked in again.
    pub(crate) fn reinit(&mut self, prev: Option<Arc<Slab>>, reserved: usize) {
        debug_assert!(
            self.tasks.iter_mut().all(|slot| slot.get_mut().is_none()),
            "recycled a slab with unconsumed tasks"
        );

        *self.next_free_slot.get_mut() = reserved;
        self.published.iter_mut().for_each(|word| *word.get_mut() = 0);
        *self.consumed.get_mut() = [0; NUM_WORDS];
        *self.prev.get_mut() = prev;
    }

    /// Claims the next free slot, or `None` if the slab is full.
    ///
    /// Relaxed is enough: the counter only hands out mutually exclusive
    /// indices, the payload is ordered by the publish bit.
    pub(crate) fn reserve_slot(&self) -> Option<usize> {
        let slot = self.next_free_slot.fetch_add(1, Ordering::Relaxed);
        (slot < SLAB_SIZE).then_some(slot)
    }

    /// Stores `task` in `slot` and makes it visible to the consumer.
    ///
    /// # Safety
    ///
    /// The caller must own `slot`, either through `reserve_slot` or because
    /// it was reserved when the slab was created.
    pub(crate) unsafe fn publish(&self, slot: usize, task: Task) {
        let (word, mask) = locate(slot);
        debug_assert_eq!(
            self.published[word].load(Ordering::Relaxed) & mask,
            0,
            "slot {slot} published twice"
        );

        // Safety: exclusive slot ownership, the consumer won't read it until
        // the bit below is set.
        unsafe { *self.tasks[slot].get() = Some(task) };
        self.published[word].fetch_or(mask, Ordering::Release);
    }

    /// Moves out the oldest published and not yet consumed task.
    ///
    /// # Safety
    ///
    /// Consumer thread only.
    pub(crate) unsafe fn take_next(&self) -> Option<Task> {
        // Safety: `consumed` is consumer only.
        let consumed = unsafe { &mut *self.consumed.get() };

        for (w, consumed_word) in consumed.iter_mut().enumerate() {
            let unread = self.published[w].load(Ordering::Acquire) & !*consumed_word;
            if unread == 0 {
                continue;
            }

            let bit = unread.trailing_zeros() as usize;
            let slot = w * BITS_PER_WORD + bit;
            *consumed_word |= 1 << bit;

            // Safety: the acquire load above synchronizes with the producer's
            // release publish, the slot is fully written and nobody else will
            // touch it again.
            let task = unsafe { (*self.tasks[slot].get()).take() };
            debug_assert!(task.is_some(), "published slot {slot} was empty");
            return task;
        }

        None
    }

    /// Every slot has been published and consumed.
    ///
    /// # Safety
    ///
    /// Consumer thread only.
    pub(crate) unsafe fn is_fully_consumed(&self) -> bool {
        // Safety: `consumed` is consumer only.
        let consumed = unsafe { &*self.consumed.get() };
        consumed.iter().all(|word| *word == BitWord::MAX)
    }

    /// At least one slot is published but not consumed yet.
    ///
    /// # Safety
    ///
    /// Consumer thread only.
    pub(crate) unsafe fn has_unconsumed(&self) -> bool {
        // Safety: `consumed` is consumer only.
        let consumed = unsafe { &*self.consumed.get() };
        consumed
            .iter()
            .zip(&self.published)
            .any(|(consumed, published)| published.load(Ordering::Acquire) & !consumed != 0)
    }

    /// # Safety
    ///
    /// Consumer thread only.
    pub(crate) unsafe fn prev(&self) -> Option<&Arc<Slab>> {
        unsafe { (*self.prev.get()).as_ref() }
    }

    /// Replaces the link to the next older slab, returning the old link.
    ///
    /// # Safety
    ///
    /// Consumer thread only, and the caller must not hold a reference
    /// obtained from [`Slab::prev`] across this call.
    pub(crate) unsafe fn replace_prev(&self, prev: Option<Arc<Slab>>) -> Option<Arc<Slab>> {
        unsafe { std::mem::replace(&mut *self.prev.get(), prev) }
    }

    /// Unlinks the older slab when we have exclusive access.
    pub(crate) fn take_prev_mut(&mut self) -> Option<Arc<Slab>> {
        self.prev.get_mut().take()
    }
}

impl fmt::Debug for Slab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let published = self
            .published
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones())
            .sum::<u32>();

        f.debug_struct("Slab")
            .field("next_free_slot", &self.next_free_slot.load(Ordering::Relaxed))
            .field("published", &published)
            .finish_non_exhaustive()
    }
}

#[inline(always)]
fn locate(slot: usize) -> (usize, BitWord) {
    (slot / BITS_PER_WORD, 1 << (slot % BITS_PER_WORD))
}
