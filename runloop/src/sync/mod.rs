//! Synchronization primitives shared by the runners.

pub(crate) mod atomic_arc;
pub(crate) use atomic_arc::AtomicArc;
