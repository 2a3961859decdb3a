//! Double-wide compare-and-swap primitive.
//!
//! The cyclic-ring queues (LCRQ, SCQ2) require an atomic compare-exchange
//! over a `{u64, pointer}` pair. This module packs such a pair into a
//! `u128` and delegates to [`portable_atomic::AtomicU128`], which selects
//! `cmpxchg16b` / `casp` where available and a lock-based fallback
//! elsewhere. The algorithm layer never touches the platform details.

use portable_atomic::AtomicU128;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;

/// A decomposed double-wide cell value: a tag word and a pointer.
///
/// The meaning of `idx` is up to the ring using the cell (LCRQ packs a
/// safe bit and a cycle index into it; SCQ2 packs a cycle and a safe bit).
pub(crate) struct Cell<T> {
    pub idx: u64,
    pub ptr: *mut T,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Cell<T> {}

impl<T> Cell<T> {
    #[inline]
    fn pack(self) -> u128 {
        (u128::from(self.ptr as u64) << 64) | u128::from(self.idx)
    }

    #[inline]
    fn unpack(bits: u128) -> Self {
        Self {
            idx: bits as u64,
            ptr: (bits >> 64) as u64 as *mut T,
        }
    }
}

/// A 16-byte atomic cell supporting double-wide CAS.
#[repr(transparent)]
pub(crate) struct AtomicCell<T> {
    bits: AtomicU128,
    _marker: PhantomData<*mut T>,
}

impl<T> AtomicCell<T> {
    pub(crate) fn new(idx: u64, ptr: *mut T) -> Self {
        Self {
            bits: AtomicU128::new(Cell { idx, ptr }.pack()),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> Cell<T> {
        Cell::unpack(self.bits.load(order))
    }

    /// Single-shot double-wide CAS.
    ///
    /// Weak semantics: may fail spuriously on LL/SC targets. Every caller
    /// sits in a retry loop that re-reads the cell, so a spurious failure
    /// is indistinguishable from losing a race.
    #[inline]
    pub(crate) fn dwcas(&self, expected: Cell<T>, desired: Cell<T>) -> bool {
        self.bits
            .compare_exchange_weak(
                expected.pack(),
                desired.pack(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}
