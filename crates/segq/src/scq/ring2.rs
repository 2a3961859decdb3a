//! SCQ2 - bounded scalable circular queue over double-wide cells.
//!
//! Cells carry `{cycle|safe, ptr}` and are claimed with a 128-bit CAS.
//! The ring has twice as many cells as its capacity, which is what makes
//! enqueue livelock-free without a patience counter, and a dequeue-side
//! *threshold* counter bounds the number of failed scans before the ring
//! may be declared empty.

use crate::dwcas::{AtomicCell, Cell};
use crossbeam_utils::CachePadded;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::{compose, ecycle, index, status, BoundedRing, CAPACITY, RING, THRESHOLD};

/// Bounded pointer queue: 2·CAPACITY double-wide cells.
pub(crate) struct Scq2Ring<T> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    threshold: CachePadded<AtomicI64>,
    cells: Box<[CachePadded<AtomicCell<T>>]>,
}

// Safety: cells hold element addresses behind atomics; the ring never
// dereferences them.
unsafe impl<T: Send> Send for Scq2Ring<T> {}
unsafe impl<T: Send> Sync for Scq2Ring<T> {}

impl<T> Scq2Ring<T> {
    fn alloc_cells() -> Box<[CachePadded<AtomicCell<T>>]> {
        let mut cells = Vec::with_capacity(RING);
        cells.resize_with(RING, || {
            CachePadded::new(AtomicCell::new(compose(true, 0), ptr::null_mut()))
        });
        cells.into_boxed_slice()
    }

    /// Restores `head ≤ tail` after failed dequeue tickets overshot the
    /// tail.
    fn catchup(&self, mut tail: u64, mut head: u64) {
        while self
            .tail
            .compare_exchange(tail, head, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            head = self.head.load(Ordering::SeqCst);
            tail = self.tail.load(Ordering::SeqCst);
            if tail >= head {
                break;
            }
        }
    }
}

impl<T: Send> BoundedRing<T> for Scq2Ring<T> {
    fn fresh() -> Self {
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            // Negative threshold is the drained fast path; the first
            // enqueue raises it.
            threshold: CachePadded::new(AtomicI64::new(-1)),
            cells: Self::alloc_cells(),
        }
    }

    fn with_first(elem: NonNull<T>) -> Self {
        let ring = Self::fresh();
        let seeded = ring.try_enqueue::<false>(elem);
        debug_assert!(seeded, "a fresh ring accepts its seed element");
        ring
    }

    fn try_enqueue<const NONEMPTY: bool>(&self, elem: NonNull<T>) -> bool {
        loop {
            let ticket = self.tail.fetch_add(1, Ordering::SeqCst);

            // Tickets count attempts, so this may under-report capacity,
            // never over-report it.
            let head = self.head.load(Ordering::SeqCst);
            if ticket as i64 - head as i64 >= CAPACITY as i64 {
                return false;
            }

            let cell = &self.cells[ticket as usize % RING];
            let current = cell.load(Ordering::SeqCst);
            let safe = status(current.idx);
            let cycle = index(current.idx);

            if current.ptr.is_null()
                && cycle < ecycle(ticket)
                && (safe || self.head.load(Ordering::SeqCst) <= ticket)
            {
                let desired = Cell {
                    idx: compose(true, ecycle(ticket)),
                    ptr: elem.as_ptr(),
                };
                if cell.dwcas(current, desired) {
                    if !NONEMPTY {
                        self.threshold.store(THRESHOLD, Ordering::SeqCst);
                    } else if self.threshold.load(Ordering::SeqCst) != THRESHOLD {
                        self.threshold.store(THRESHOLD, Ordering::SeqCst);
                    }
                    return true;
                }
            }
            // Lost the cell; take a fresh ticket.
        }
    }

    fn try_dequeue(&self) -> Option<NonNull<T>> {
        if self.threshold.load(Ordering::SeqCst) < 0 {
            return None;
        }

        loop {
            let ticket = self.head.fetch_add(1, Ordering::SeqCst);
            let cell = &self.cells[ticket as usize % RING];
            let expected_cycle = ecycle(ticket);

            loop {
                let current = cell.load(Ordering::SeqCst);
                let safe = status(current.idx);
                let cycle = index(current.idx);

                if cycle == expected_cycle {
                    if current.ptr.is_null() {
                        // Already visited this lap; nothing to take.
                        break;
                    }
                    // Consume: empty the cell, keep its lap and safe bit.
                    let desired = Cell {
                        idx: compose(safe, cycle),
                        ptr: ptr::null_mut(),
                    };
                    if cell.dwcas(current, desired) {
                        return NonNull::new(current.ptr);
                    }
                } else if cycle < expected_cycle {
                    let desired = if current.ptr.is_null() {
                        // Empty transition: mark the lap visited so the
                        // matching enqueue fails cleanly.
                        Cell {
                            idx: compose(safe, expected_cycle),
                            ptr: ptr::null_mut(),
                        }
                    } else {
                        // Straggling element from an earlier lap: clear
                        // the safe bit so enqueues skip this cell until
                        // its consumer catches up.
                        Cell {
                            idx: compose(false, cycle),
                            ptr: current.ptr,
                        }
                    };
                    if cell.dwcas(current, desired) {
                        break;
                    }
                } else {
                    // Our lap is already over at this cell.
                    break;
                }
            }

            // This ticket yielded nothing; the ring may be drained.
            let tail = self.tail.load(Ordering::SeqCst);
            if tail <= ticket + 1 {
                self.catchup(tail, ticket + 1);
                self.threshold.fetch_sub(1, Ordering::SeqCst);
                return None;
            }
            if self.threshold.fetch_sub(1, Ordering::SeqCst) <= 0 {
                return None;
            }
        }
    }

    fn reset_threshold(&self, order: Ordering) {
        self.threshold.store(THRESHOLD, order);
    }
}
