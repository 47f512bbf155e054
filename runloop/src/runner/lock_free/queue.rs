use crate::runner::SPILL_TO_HEAP_THRESHOLD;
use crate::runner::lock_free::slab::Slab;
use crate::sync::AtomicArc;
use crate::task::Task;
use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Multi-producer single-consumer task queue built out of a chain of slabs.
///
/// `tail` points to the newest slab and every slab owns its older `prev`.
/// Producers only ever touch `tail`, the consumer walks the chain from the
/// tail down to the oldest slab and drains it oldest-first. A fully consumed
/// oldest slab is detached from the chain, parked on the `retired` list and
/// recycled into the single-slot free list once nobody can reach it anymore.
///
/// Tasks posted by one thread run in order. There is no ordering between
/// tasks posted concurrently by different threads.
pub(crate) struct SlabChain {
    tail: AtomicArc<Slab>,

    // Only ever swapped, never `load()`ed, so slabs in here have a strong
    // count of exactly one.
    free_slab: AtomicArc<Slab>,

    // Consumer only.
    retired: UnsafeCell<Vec<Arc<Slab>>>,

    slabs_allocated: AtomicUsize,

    slabs_freed: AtomicUsize,
}

// Safety: `retired` is only accessed from the consumer side, through the
// `unsafe` methods whose contract is "consumer thread only". Everything else
// is atomic.
unsafe impl Send for SlabChain {}
unsafe impl Sync for SlabChain {}

impl SlabChain {
    pub(crate) fn new(preallocate_free_slab: bool) -> Self {
        let chain = Self {
            tail: AtomicArc::empty(),
            free_slab: AtomicArc::empty(),
            retired: UnsafeCell::new(Vec::new()),
            slabs_allocated: AtomicUsize::new(0),
            slabs_freed: AtomicUsize::new(0),
        };

        chain.tail.swap(Some(chain.alloc_slab(None, 0)));
        if preallocate_free_slab {
            chain.free_slab.swap(Some(chain.alloc_slab(None, 0)));
        }

        chain
    }

    /// Appends `task`. Callable from any thread, never blocks.
    pub(crate) fn push(&self, task: Task) {
        let (slab, slot) = self.reserve();

        // Safety: `reserve` handed us exclusive ownership of `slot`.
        unsafe { slab.publish(slot, task) };
    }

    fn reserve(&self) -> (Arc<Slab>, usize) {
        loop {
            let Some(tail) = self.tail.load() else {
                let fresh = self.alloc_slab(None, 1);
                match self.tail.compare_exchange(None, Some(fresh.clone())) {
                    Ok(_) => return (fresh, 0),
                    Err(rejected) => {
                        drop(rejected);
                        self.abandon(fresh);
                        continue;
                    }
                }
            };

            if let Some(slot) = tail.reserve_slot() {
                return (tail, slot);
            }

            // The tail is full, try to extend the chain. Slot 0 of the new
            // slab is ours if we win.
            let fresh = self.alloc_slab(Some(tail.clone()), 1);
            match self.tail.compare_exchange(Some(&tail), Some(fresh.clone())) {
                Ok(_) => return (fresh, 0),
                Err(rejected) => {
                    // Somebody else extended the chain first.
                    drop(rejected);
                    self.abandon(fresh);
                }
            }
        }
    }

    /// Removes the oldest task available.
    ///
    /// # Safety
    ///
    /// Consumer thread only.
    pub(crate) unsafe fn pop(&self) -> Option<Task> {
        let task = unsafe { self.pop_from_chain() };

        // Our snapshot of the chain is gone by now, retired slabs may have
        // become reclaimable.
        unsafe { self.reclaim_retired() };

        task
    }

    unsafe fn pop_from_chain(&self) -> Option<Task> {
        let tail = self.tail.load()?;

        // Newest first. Only the consumer mutates `prev` links, the
        // references stay valid until we detach something.
        let mut chain = SmallVec::<[&Arc<Slab>; SPILL_TO_HEAP_THRESHOLD]>::new();
        let mut oldest = &tail;
        chain.push(oldest);
        while let Some(prev) = unsafe { oldest.prev() } {
            chain.push(prev);
            oldest = prev;
        }

        while let Some(slab) = chain.pop() {
            if let Some(task) = unsafe { slab.take_next() } {
                return Some(task);
            }

            let detachable = unsafe { slab.is_fully_consumed() && slab.prev().is_none() };
            if !detachable {
                continue;
            }

            // Take our own reference before unlinking, `slab` borrows from
            // the successor's `prev`.
            let slab = Arc::clone(slab);
            match chain.last() {
                Some(successor) => {
                    let link = unsafe { successor.replace_prev(None) };
                    debug_assert!(link.is_some_and(|link| Arc::ptr_eq(&link, &slab)));
                    unsafe { self.retire(slab) };
                }
                None => {
                    // Oldest and newest at once. If a producer extended the
                    // chain meanwhile the CAS fails and the new tail will
                    // detach this slab on a later pop.
                    if self.tail.compare_exchange(Some(&slab), None).is_ok() {
                        unsafe { self.retire(slab) };
                    }
                }
            }
        }

        None
    }

    /// Whether every published task has been consumed.
    ///
    /// # Safety
    ///
    /// Consumer thread only.
    pub(crate) unsafe fn is_idle(&self) -> bool {
        let Some(tail) = self.tail.load() else {
            return true;
        };

        let mut slab = &tail;
        loop {
            if unsafe { slab.has_unconsumed() } {
                return false;
            }

            match unsafe { slab.prev() } {
                Some(prev) => slab = prev,
                None => return true,
            }
        }
    }

    /// Number of slabs allocated from the heap so far.
    pub(crate) fn slabs_allocated(&self) -> usize {
        self.slabs_allocated.load(Ordering::Relaxed)
    }

    /// Number of slabs given back to the heap so far.
    pub(crate) fn slabs_freed(&self) -> usize {
        self.slabs_freed.load(Ordering::Relaxed)
    }

    unsafe fn retire(&self, slab: Arc<Slab>) {
        trace!(?slab, "retiring drained slab");
        unsafe { (*self.retired.get()).push(slab) };
    }

    /// Recycles retired slabs that no producer can reach anymore: no loader
    /// is in flight on the tail and ours is the last strong reference.
    unsafe fn reclaim_retired(&self) {
        let retired = unsafe { &mut *self.retired.get() };
        if retired.is_empty() {
            return;
        }

        let mut i = 0;
        while i < retired.len() {
            if self.tail.is_quiescent(&retired[i]) && Arc::get_mut(&mut retired[i]).is_some() {
                let slab = retired.swap_remove(i);
                self.recycle(slab);
            } else {
                i += 1;
            }
        }
    }

    /// Puts an unreachable slab on the free list, or frees it if the list is
    /// already occupied.
    fn recycle(&self, slab: Arc<Slab>) {
        debug_assert_eq!(Arc::strong_count(&slab), 1);

        match self.free_slab.compare_exchange(None, Some(slab)) {
            Ok(_) => trace!("slab recycled into the free list"),
            Err(Some(slab)) => self.free(slab),
            Err(None) => unreachable!("compare_exchange hands back what it was given"),
        }
    }

    /// Gives back a slab that lost the race to become the tail. It was never
    /// published so nobody else can hold it.
    fn abandon(&self, mut slab: Arc<Slab>) {
        match Arc::get_mut(&mut slab) {
            Some(inner) => {
                drop(inner.take_prev_mut());
                self.recycle(slab);
            }
            None => self.free(slab),
        }
    }

    fn free(&self, slab: Arc<Slab>) {
        trace!(?slab, "freeing slab");
        self.slabs_freed.fetch_add(1, Ordering::Relaxed);
        drop(slab);
    }

    fn alloc_slab(&self, prev: Option<Arc<Slab>>, reserved: usize) -> Arc<Slab> {
        if let Some(mut slab) = self.free_slab.swap(None) {
            if let Some(inner) = Arc::get_mut(&mut slab) {
                inner.reinit(prev, reserved);
                trace!("reusing slab from the free list");
                return slab;
            }

            self.free(slab);
        }

        let allocated = self.slabs_allocated.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(allocated, "allocating slab");
        Arc::new(Slab::new(prev, reserved))
    }
}

impl Drop for SlabChain {
    // Unlink iteratively, dropping a long chain through nested `prev` drops
    // could overflow the stack.
    fn drop(&mut self) {
        let mut next = self.tail.swap(None);
        while let Some(mut slab) = next {
            next = Arc::get_mut(&mut slab).and_then(Slab::take_prev_mut);
        }
    }
}

impl fmt::Debug for SlabChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabChain")
            .field("tail", &self.tail)
            .field("slabs_allocated", &self.slabs_allocated())
            .field("slabs_freed", &self.slabs_freed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::lock_free::slab::SLAB_SIZE;
    use anyhow::Result;
    use parking_lot::Mutex;
    use rstest::rstest;
    use std::collections::HashMap;
    use std::sync::Barrier;
    use std::thread;

    fn drain(chain: &SlabChain) -> usize {
        let mut n = 0;
        while let Some(task) = unsafe { chain.pop() } {
            task.run();
            n += 1;
        }
        n
    }

    #[test]
    fn test_empty_chain() {
        let chain = SlabChain::new(true);

        assert!(unsafe { chain.is_idle() });
        assert!(unsafe { chain.pop() }.is_none());
        assert_eq!(chain.slabs_allocated(), 2);
    }

    #[rstest]
    #[case::one(1)]
    #[case::one_slab(SLAB_SIZE)]
    #[case::spills(SLAB_SIZE + 1)]
    #[case::many_slabs(SLAB_SIZE * 5 + 17)]
    fn test_fifo_single_producer(#[case] n: usize) {
        let log = Arc::new(Mutex::new(Vec::with_capacity(n)));
        let chain = SlabChain::new(true);

        for i in 0..n {
            let log = log.clone();
            chain.push(Task::new(move || log.lock().push(i)));
        }

        assert!(!unsafe { chain.is_idle() });
        assert_eq!(drain(&chain), n);
        assert!(unsafe { chain.is_idle() });
        assert_eq!(*log.lock(), (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn test_drained_tail_is_detached_and_recycled() {
        let chain = SlabChain::new(false);
        assert_eq!(chain.slabs_allocated(), 1);

        for _ in 0..SLAB_SIZE {
            chain.push(Task::new(|| {}));
        }
        assert_eq!(drain(&chain), SLAB_SIZE);

        // The only slab was fully consumed: detached and parked in the free
        // list, then reused by the next push.
        assert!(chain.tail.load().is_none());
        chain.push(Task::new(|| {}));
        assert_eq!(drain(&chain), 1);
        assert_eq!(chain.slabs_allocated(), 1);
        assert_eq!(chain.slabs_freed(), 0);
    }

    #[test]
    fn test_push_interleaved_with_pop() -> Result<()> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = SlabChain::new(true);

        let mut next = 0;
        for round in 0..(SLAB_SIZE * 3) {
            for _ in 0..3 {
                let log = log.clone();
                let value = next;
                chain.push(Task::new(move || log.lock().push(value)));
                next += 1;
            }

            // Consume a bit less than we produce.
            for _ in 0..(2 + round % 2) {
                if let Some(task) = unsafe { chain.pop() } {
                    task.run();
                }
            }
        }
        drain(&chain);

        assert_eq!(*log.lock(), (0..next).collect::<Vec<_>>());
        assert!(chain.slabs_allocated() <= 4, "{chain:?}");
        Ok(())
    }

    #[test]
    fn test_concurrent_producers_keep_per_thread_order() {
        const PRODUCERS: usize = 4;
        const TASKS_PER_PRODUCER: usize = SLAB_SIZE * 4;

        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Arc::new(SlabChain::new(true));
        let barrier = Arc::new(Barrier::new(PRODUCERS));

        let producers = (0..PRODUCERS)
            .map(|producer| {
                let log = log.clone();
                let chain = chain.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..TASKS_PER_PRODUCER {
                        let log = log.clone();
                        chain.push(Task::new(move || log.lock().push((producer, i))));
                    }
                })
            })
            .collect::<Vec<_>>();

        // Consume while the producers are still running.
        let mut consumed = 0;
        while consumed < PRODUCERS * TASKS_PER_PRODUCER {
            match unsafe { chain.pop() } {
                Some(task) => {
                    task.run();
                    consumed += 1;
                }
                None => thread::yield_now(),
            }
        }

        for producer in producers {
            producer.join().expect("producer panicked");
        }
        assert!(unsafe { chain.pop() }.is_none());

        let mut last_seen = HashMap::new();
        for (producer, i) in log.lock().iter().copied() {
            if let Some(prev) = last_seen.insert(producer, i) {
                assert!(prev < i, "producer {producer} ran {i} after {prev}");
            }
        }
        assert_eq!(last_seen.len(), PRODUCERS);
    }
}
