//! LCRQ - linked concurrent ring queue.
//!
//! Implementation of the (L)CRQ by Morrison & Afek: bounded cyclic rings
//! of double-wide cells linked into an unbounded FIFO by the segmented
//! shell. Each cell carries `{idx, ptr}` and is mutated with a 128-bit
//! CAS; the top bit of `idx` is the *safe* flag and the top bit of the
//! tail ticket is the *closed* flag.
//!
//! The safe flag breaks livelock between enqueuers that wrap around to a
//! cell whose consumer from the previous cycle has not completed: once a
//! dequeuer marks the cell unsafe, enqueues at that cell are refused until
//! its straggling consumer finishes, forcing producers to close the ring
//! and append a fresh segment instead of spinning.

use crate::dwcas::{AtomicCell, Cell};
use crate::error::QueueError;
use crate::invariants::debug_assert_tid;
use crate::list::{Segment, SegmentList};
use crate::MAX_THREADS;
use crossbeam_utils::CachePadded;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Number of cells per ring.
const RING_SIZE: usize = 1024;

/// Safe flag (cell idx) and closed flag (tail ticket).
const STATUS_BIT: u64 = 1 << 63;
const INDEX_MASK: u64 = !STATUS_BIT;

/// Enqueue attempts within one ring before closing it.
const PATIENCE: usize = 10;

#[inline]
fn status(composed: u64) -> bool {
    composed & STATUS_BIT != 0
}

#[inline]
fn index(composed: u64) -> u64 {
    composed & INDEX_MASK
}

#[inline]
fn compose(status: bool, idx: u64) -> u64 {
    if status {
        STATUS_BIT | idx
    } else {
        idx
    }
}

/// One bounded cyclic ring.
///
/// Ring operations are sequentially consistent throughout; the
/// relaxed/acquire/release discipline lives in the shell, which is what
/// publishes and consumes whole segments.
struct Crq<T> {
    head_ticket: CachePadded<AtomicU64>,
    tail_ticket: CachePadded<AtomicU64>,
    cells: Box<[CachePadded<AtomicCell<T>>]>,
}

impl<T> Crq<T> {
    /// Cells start at `SAFE | i` so cycle-0 enqueues find them willing.
    fn init_cells(first: *mut T) -> Box<[CachePadded<AtomicCell<T>>]> {
        let mut cells = Vec::with_capacity(RING_SIZE);
        cells.push(CachePadded::new(AtomicCell::new(STATUS_BIT, first)));
        for i in 1..RING_SIZE {
            cells.push(CachePadded::new(AtomicCell::new(
                STATUS_BIT | i as u64,
                ptr::null_mut(),
            )));
        }
        cells.into_boxed_slice()
    }

    fn fresh() -> Self {
        Self {
            head_ticket: CachePadded::new(AtomicU64::new(0)),
            tail_ticket: CachePadded::new(AtomicU64::new(0)),
            cells: Self::init_cells(ptr::null_mut()),
        }
    }

    /// A ring with `first` already occupying cell 0 (ticket 0 spent).
    fn with_first(first: NonNull<T>) -> Self {
        Self {
            head_ticket: CachePadded::new(AtomicU64::new(0)),
            tail_ticket: CachePadded::new(AtomicU64::new(1)),
            cells: Self::init_cells(first.as_ptr()),
        }
    }

    fn try_enqueue(&self, elem: *mut T) -> bool {
        let mut attempts = 0;
        loop {
            let ticket = self.tail_ticket.fetch_add(1, Ordering::SeqCst);
            if status(ticket) {
                // Ring is closed; only a new segment can take the element.
                return false;
            }
            let tail_ticket = index(ticket);

            let cell = &self.cells[tail_ticket as usize % RING_SIZE];
            let current = cell.load(Ordering::SeqCst);
            let safe = status(current.idx);
            let cell_idx = index(current.idx);

            if current.ptr.is_null()
                && cell_idx <= tail_ticket
                && (safe || self.head_ticket.load(Ordering::SeqCst) <= tail_ticket)
            {
                let desired = Cell {
                    idx: STATUS_BIT | tail_ticket,
                    ptr: elem,
                };
                if cell.dwcas(current, desired) {
                    return true;
                }
            }

            let head_ticket = self.head_ticket.load(Ordering::SeqCst);
            let starved =
                tail_ticket as i64 - head_ticket as i64 >= RING_SIZE as i64;
            if starved || attempts >= PATIENCE {
                self.tail_ticket.fetch_or(STATUS_BIT, Ordering::SeqCst);
                return false;
            }

            attempts += 1;
        }
    }

    fn try_dequeue(&self) -> Option<NonNull<T>> {
        loop {
            let head_ticket = self.head_ticket.fetch_add(1, Ordering::SeqCst);
            let cell = &self.cells[head_ticket as usize % RING_SIZE];

            loop {
                let current = cell.load(Ordering::SeqCst);
                let safe = status(current.idx);
                let cell_idx = index(current.idx);

                if cell_idx > head_ticket {
                    break;
                }

                if !current.ptr.is_null() {
                    if cell_idx == head_ticket {
                        // Dequeue transition: empty the cell and bump it
                        // one full cycle forward.
                        let desired = Cell {
                            idx: compose(safe, head_ticket + RING_SIZE as u64),
                            ptr: ptr::null_mut(),
                        };
                        if cell.dwcas(current, desired) {
                            return NonNull::new(current.ptr);
                        }
                    } else {
                        // Stale winner from an earlier cycle: clear the
                        // safe bit so no enqueue lands here this cycle.
                        let desired = Cell {
                            idx: cell_idx,
                            ptr: current.ptr,
                        };
                        if cell.dwcas(current, desired) {
                            break;
                        }
                    }
                } else {
                    // Empty transition: our ticket came first; advance the
                    // cell a cycle so the matching enqueue fails cleanly.
                    let desired = Cell {
                        idx: compose(safe, head_ticket + RING_SIZE as u64),
                        ptr: ptr::null_mut(),
                    };
                    if cell.dwcas(current, desired) {
                        break;
                    }
                }
            }

            // This ticket yielded nothing; the ring may be drained.
            let tail_ticket = index(self.tail_ticket.load(Ordering::SeqCst));
            if tail_ticket <= head_ticket + 1 {
                self.fix_state();
                return None;
            }
        }
    }

    /// Restores `head ≤ tail` after failed dequeue tickets overshot the
    /// tail.
    fn fix_state(&self) {
        loop {
            let tail = self.tail_ticket.fetch_add(0, Ordering::SeqCst);
            let head = self.head_ticket.fetch_add(0, Ordering::SeqCst);

            if self.tail_ticket.load(Ordering::SeqCst) != tail {
                continue;
            }
            if head <= tail {
                return;
            }
            if self
                .tail_ticket
                .compare_exchange(tail, head, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Whether the closed flag has been set on the tail ticket.
    fn is_closed(&self) -> bool {
        status(self.tail_ticket.load(Ordering::SeqCst))
    }
}

/// One segment: a ring plus the successor link.
struct CrqNode<T> {
    ring: Crq<T>,
    next: CachePadded<AtomicPtr<CrqNode<T>>>,
}

// Safety: cells hold element addresses behind atomics; the ring never
// dereferences them.
unsafe impl<T: Send> Send for CrqNode<T> {}
unsafe impl<T: Send> Sync for CrqNode<T> {}

impl<T: Send> Segment<T> for CrqNode<T> {
    fn fresh() -> Box<Self> {
        Box::new(Self {
            ring: Crq::fresh(),
            next: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        })
    }

    fn with_first(elem: NonNull<T>) -> Box<Self> {
        Box::new(Self {
            ring: Crq::with_first(elem),
            next: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        })
    }

    #[inline]
    fn next(&self) -> &AtomicPtr<Self> {
        &self.next
    }

    #[inline]
    fn try_enqueue(&self, elem: NonNull<T>) -> bool {
        self.ring.try_enqueue(elem.as_ptr())
    }

    #[inline]
    fn try_dequeue(&self) -> Option<NonNull<T>> {
        self.ring.try_dequeue()
    }
}

/// Lock-free MPMC FIFO over linked cyclic rings (LCRQ).
pub struct Lcrq<T: Send> {
    list: SegmentList<T, CrqNode<T>>,
}

impl<T: Send> Lcrq<T> {
    /// Creates a queue sized for [`MAX_THREADS`] threads.
    pub fn new() -> Self {
        Self::with_max_threads(MAX_THREADS).expect("MAX_THREADS is a valid thread count")
    }

    /// Creates a queue sized for `max_threads` threads.
    pub fn with_max_threads(max_threads: usize) -> Result<Self, QueueError> {
        if max_threads == 0 || max_threads > MAX_THREADS {
            return Err(QueueError::MaxThreadsExceeded {
                requested: max_threads,
                limit: MAX_THREADS,
            });
        }
        Ok(Self {
            list: SegmentList::new(max_threads),
        })
    }

    /// Appends `elem` to the queue.
    ///
    /// `tid` must be in `[0, max_threads)` and exclusive to the calling
    /// thread for the duration of the call.
    pub fn enqueue(&self, elem: NonNull<T>, tid: usize) {
        debug_assert_tid!(tid, self.list.max_threads());
        self.list.enqueue(elem, tid);
    }

    /// Removes the oldest element, or returns `None` if the queue is
    /// observed empty.
    pub fn dequeue(&self, tid: usize) -> Option<NonNull<T>> {
        debug_assert_tid!(tid, self.list.max_threads());
        self.list.dequeue(tid)
    }

    /// Whether the closed flag is set on the current head segment's ring.
    ///
    /// Observability hook for tests; `tid` follows the same exclusivity
    /// contract as `dequeue`.
    #[doc(hidden)]
    pub fn head_segment_closed(&self, tid: usize) -> bool {
        debug_assert_tid!(tid, self.list.max_threads());
        self.list.with_head(tid, |node| node.ring.is_closed())
    }
}

impl<T: Send> Default for Lcrq<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_of(values: &[u64], i: usize) -> NonNull<u64> {
        NonNull::from(&values[i])
    }

    #[test]
    fn test_ring_fills_then_closes() {
        let values: Vec<u64> = (0..RING_SIZE as u64 + 1).collect();
        let ring = Crq::<u64>::fresh();

        for i in 0..RING_SIZE {
            assert!(ring.try_enqueue(addr_of(&values, i).as_ptr()));
        }
        assert!(!ring.is_closed());

        // The overflow attempt must close the ring by capacity.
        assert!(!ring.try_enqueue(addr_of(&values, RING_SIZE).as_ptr()));
        assert!(ring.is_closed());

        // A closed ring still surrenders its contents in order.
        for i in 0..RING_SIZE {
            let elem = ring.try_dequeue().expect("ring holds RING_SIZE elements");
            assert_eq!(unsafe { *elem.as_ref() }, values[i]);
        }
        assert!(ring.try_dequeue().is_none());
    }

    #[test]
    fn test_patience_exhaustion_closes_ring() {
        let values: Vec<u64> = (0..PATIENCE as u64 + 2).collect();
        let ring = Crq::<u64>::fresh();

        // Occupy the cells the first PATIENCE + 1 tickets map to, as if
        // racing enqueuers published there ahead of this thread.
        for i in 0..=PATIENCE {
            let cell = &ring.cells[i];
            let current = cell.load(Ordering::SeqCst);
            let desired = Cell {
                idx: current.idx,
                ptr: addr_of(&values, i).as_ptr(),
            };
            assert!(cell.dwcas(current, desired));
        }

        // Far from capacity starvation, so the run of failed claims must
        // close the ring through the patience bound.
        assert!(!ring.try_enqueue(addr_of(&values, PATIENCE + 1).as_ptr()));
        assert!(ring.is_closed());

        // The closed ring still drains the occupied cells in order.
        for i in 0..=PATIENCE {
            let elem = ring.try_dequeue().expect("occupied cell");
            assert_eq!(unsafe { *elem.as_ref() }, values[i]);
        }
        assert!(ring.try_dequeue().is_none());
    }

    #[test]
    fn test_fix_state_repairs_overshot_head() {
        let values = vec![7u64];
        let ring = Crq::<u64>::fresh();

        // Failed dequeues advance head past tail; fix_state must repair
        // the ticket order so a later enqueue still succeeds.
        for _ in 0..3 {
            assert!(ring.try_dequeue().is_none());
        }
        assert!(ring.try_enqueue(addr_of(&values, 0).as_ptr()));
        let elem = ring.try_dequeue().expect("element was enqueued");
        assert_eq!(unsafe { *elem.as_ref() }, 7);
    }

    #[test]
    fn test_seeded_ring_dequeues_seed_first() {
        let values: Vec<u64> = vec![1, 2];
        let ring = Crq::<u64>::with_first(addr_of(&values, 0));
        assert!(ring.try_enqueue(addr_of(&values, 1).as_ptr()));

        assert_eq!(unsafe { *ring.try_dequeue().unwrap().as_ref() }, 1);
        assert_eq!(unsafe { *ring.try_dequeue().unwrap().as_ref() }, 2);
        assert!(ring.try_dequeue().is_none());
    }

    #[test]
    fn test_queue_roundtrip_across_segments() {
        let count = RING_SIZE + 1;
        let values: Vec<u64> = (0..count as u64).collect();
        let queue = Lcrq::<u64>::with_max_threads(1).unwrap();

        for i in 0..count {
            queue.enqueue(addr_of(&values, i), 0);
        }
        for i in 0..count {
            let elem = queue.dequeue(0).expect("queue holds all elements");
            assert_eq!(unsafe { *elem.as_ref() }, values[i]);
        }
        assert!(queue.dequeue(0).is_none());
    }
}
