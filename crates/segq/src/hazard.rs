//! Hazard-pointer domain for safe segment reclamation.
//!
//! Classic SMR in the style of Michael's "Hazard Pointers: Safe Memory
//! Reclamation for Lock-Free Objects": each thread owns a fixed row of
//! hazard slots it publishes into before dereferencing shared nodes, and a
//! private retire list that is scanned against a snapshot of all slots once
//! it grows past a threshold.
//!
//! # Memory Ordering Protocol
//!
//! **Publish-before-verify (reader path):**
//! 1. Read the shared pointer
//! 2. Store it into the own hazard slot with SeqCst (the store must be
//!    ordered before the verifying re-read, which needs a store-load
//!    barrier that release/acquire alone does not provide)
//! 3. Re-read the shared pointer; if it moved, republish and retry
//!
//! **Retire path (reclaimer):**
//! 1. Append the unlinked node to the thread's retire list
//! 2. At the scan threshold, load every hazard slot (SeqCst), sort the
//!    snapshot and free exactly the retired pointers not present in it
//!
//! A node is only retired after it has been unlinked from the shared
//! structure, so any thread that publishes it into a slot *after* the
//! snapshot was taken must have read it from a location that no longer
//! reaches it; the verify step then fails and the slot is republished with
//! a live node.

use crate::invariants::{debug_assert_hp_index, debug_assert_tid};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Hazard-pointer domain protecting nodes of type `N`.
///
/// Sized at construction for a fixed number of threads and hazard slots
/// per thread. Thread ids index slot rows and retire lists; each id must
/// be used by at most one thread at a time.
pub struct HazardPointers<N> {
    /// Hazard slots, row-major by thread id. Written only by the owning
    /// thread, read by every scanning thread.
    slots: Box<[CachePadded<AtomicPtr<N>>]>,
    /// Per-thread retire lists. Accessed only by the owning thread.
    retired: Box<[CachePadded<UnsafeCell<Vec<*mut N>>>]>,
    max_threads: usize,
    hps_per_thread: usize,
    scan_threshold: usize,
}

// Safety: slot publication goes through atomics and each retire list is
// only touched by the thread whose id it belongs to. Freeing a retired
// node may happen on a different thread than the one that allocated it,
// hence the `N: Send` bound.
unsafe impl<N: Send> Send for HazardPointers<N> {}
unsafe impl<N: Send> Sync for HazardPointers<N> {}

impl<N> HazardPointers<N> {
    /// Creates a domain with one hazard slot per thread.
    pub fn new(max_threads: usize) -> Self {
        Self::with_hazards(max_threads, 1)
    }

    /// Creates a domain with `hps_per_thread` slots per thread and the
    /// default scan threshold of `2 * max_threads * hps_per_thread`.
    pub fn with_hazards(max_threads: usize, hps_per_thread: usize) -> Self {
        Self::with_scan_threshold(max_threads, hps_per_thread, 2 * max_threads * hps_per_thread)
    }

    /// Creates a domain with an explicit retire-scan threshold.
    ///
    /// The threshold trades reclamation latency against scan cost: a scan
    /// is O(slots + threshold·log(slots)) and frees at least
    /// `threshold - slots` nodes, so per-retire work stays amortised O(1)
    /// whenever `scan_threshold` exceeds the slot count.
    pub fn with_scan_threshold(
        max_threads: usize,
        hps_per_thread: usize,
        scan_threshold: usize,
    ) -> Self {
        assert!(max_threads > 0, "hazard domain needs at least one thread");
        assert!(hps_per_thread > 0, "hazard domain needs at least one slot");

        let slot_count = max_threads * hps_per_thread;
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, || CachePadded::new(AtomicPtr::new(ptr::null_mut())));

        let mut retired = Vec::with_capacity(max_threads);
        retired.resize_with(max_threads, || CachePadded::new(UnsafeCell::new(Vec::new())));

        Self {
            slots: slots.into_boxed_slice(),
            retired: retired.into_boxed_slice(),
            max_threads,
            hps_per_thread,
            scan_threshold: scan_threshold.max(1),
        }
    }

    /// Returns the number of threads this domain was sized for.
    #[inline]
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    #[inline]
    fn slot(&self, tid: usize, hp: usize) -> &AtomicPtr<N> {
        debug_assert_tid!(tid, self.max_threads);
        debug_assert_hp_index!(hp, self.hps_per_thread);
        &self.slots[tid * self.hps_per_thread + hp]
    }

    /// Publishes the pointer read from `src` into thread `tid`'s hazard
    /// slot `hp`, re-reading until a stable value was published. Returns
    /// the protected pointer.
    pub fn protect(&self, src: &AtomicPtr<N>, tid: usize, hp: usize) -> *mut N {
        let slot = self.slot(tid, hp);
        let mut protected = src.load(Ordering::Relaxed);
        loop {
            slot.store(protected, Ordering::SeqCst);
            let current = src.load(Ordering::SeqCst);
            if current == protected {
                return protected;
            }
            protected = current;
        }
    }

    /// Publishes an already-loaded snapshot into thread `tid`'s hazard
    /// slot `hp` and returns it.
    ///
    /// The caller must re-read the source atomic afterwards and retry the
    /// whole acquisition if it moved; only then is the snapshot known to
    /// have been protected before it could be retired.
    pub fn protect_ptr(&self, ptr: *mut N, tid: usize, hp: usize) -> *mut N {
        self.slot(tid, hp).store(ptr, Ordering::SeqCst);
        ptr
    }

    /// Clears one hazard slot of thread `tid`.
    pub fn clear_one(&self, tid: usize, hp: usize) {
        self.slot(tid, hp).store(ptr::null_mut(), Ordering::Release);
    }

    /// Clears every hazard slot of thread `tid`.
    pub fn clear(&self, tid: usize) {
        for hp in 0..self.hps_per_thread {
            self.clear_one(tid, hp);
        }
    }

    /// Appends an unlinked node to thread `tid`'s retire list and scans
    /// the domain once the list reaches the scan threshold.
    ///
    /// # Safety contract (internal)
    ///
    /// `ptr` must originate from `Box::into_raw`, be unreachable from the
    /// shared structure, and be retired exactly once.
    pub fn retire(&self, ptr: *mut N, tid: usize) {
        debug_assert_tid!(tid, self.max_threads);
        debug_assert!(!ptr.is_null(), "retired a null pointer");

        // SAFETY: the retire list at `tid` is only accessed by the thread
        // owning that id (caller contract), so this unsynchronized access
        // is single-writer.
        let list = unsafe { &mut *self.retired[tid].get() };
        list.push(ptr);

        if list.len() >= self.scan_threshold {
            self.scan(list);
        }
    }

    /// Frees every pointer on `list` that no hazard slot protects.
    fn scan(&self, list: &mut Vec<*mut N>) {
        let mut snapshot: Vec<*mut N> = self
            .slots
            .iter()
            .map(|slot| slot.load(Ordering::SeqCst))
            .filter(|ptr| !ptr.is_null())
            .collect();
        snapshot.sort_unstable();

        list.retain(|&ptr| {
            if snapshot.binary_search(&ptr).is_ok() {
                return true;
            }
            // SAFETY: `ptr` came from `Box::into_raw` (retire contract),
            // was unlinked before retirement and no hazard slot held it at
            // the snapshot, so no thread can still dereference it.
            unsafe { drop(Box::from_raw(ptr)) };
            false
        });
    }
}

impl<N> Drop for HazardPointers<N> {
    fn drop(&mut self) {
        // Destruction requires quiescence, so every pointer still on a
        // retire list is unreachable and unprotected.
        for list in self.retired.iter_mut() {
            for &ptr in list.get_mut().iter() {
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_protect_returns_stable_value() {
        let hp = HazardPointers::<u64>::new(2);
        let node = Box::into_raw(Box::new(42u64));
        let src = AtomicPtr::new(node);

        let protected = hp.protect(&src, 0, 0);
        assert_eq!(protected, node);
        assert_eq!(hp.slot(0, 0).load(Ordering::SeqCst), node);

        hp.clear(0);
        assert!(hp.slot(0, 0).load(Ordering::SeqCst).is_null());

        unsafe { drop(Box::from_raw(node)) };
    }

    #[test]
    fn test_scan_spares_protected_nodes() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        // Carries a byte so each instance gets a distinct heap address;
        // a zero-sized type would make every `Box::into_raw` pointer alias.
        struct DropTracker(u8);

        impl Drop for DropTracker {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            // Threshold of 4 so the fourth retire triggers a scan.
            let hp = HazardPointers::<DropTracker>::with_scan_threshold(2, 1, 4);

            let protected = Box::into_raw(Box::new(DropTracker(0)));
            hp.protect_ptr(protected, 1, 0);

            hp.retire(protected, 0);
            for i in 1..4 {
                hp.retire(Box::into_raw(Box::new(DropTracker(i))), 0);
            }
            // Scan ran: three unprotected nodes freed, the protected one kept.
            assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 3);

            hp.clear_one(1, 0);
        }
        // Domain drop frees the survivor.
        assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_retire_below_threshold_defers() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropTracker;

        impl Drop for DropTracker {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let hp = HazardPointers::<DropTracker>::with_scan_threshold(1, 1, 16);
            for _ in 0..8 {
                hp.retire(Box::into_raw(Box::new(DropTracker)), 0);
            }
            assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 0);
        }
        assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 8);
    }
}
