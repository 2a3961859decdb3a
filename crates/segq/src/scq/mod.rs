//! LSCQ - linked scalable circular queues.
//!
//! The bounded building block is the scalable circular queue of Nikolaev
//! (SPAA '19), in two flavours picked at the type level: [`Lscq2`] claims
//! ring cells with a double-wide CAS, [`Lscqd`] with a single-wide CAS
//! over tagged words plus an index indirection. Both ride the segmented
//! shell for unboundedness and hand drained segments to the shared
//! hazard-pointer domain.

use crate::error::QueueError;
use crate::invariants::debug_assert_tid;
use crate::list::{Segment, SegmentList};
use crate::MAX_THREADS;
use crossbeam_utils::CachePadded;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

mod ring2;
mod ringd;

use ring2::Scq2Ring;
use ringd::ScqdRing;

/// Ring order: capacity 2^10 elements over 2^11 cells.
const ORDER: u32 = 10;
/// Elements a segment holds.
const CAPACITY: usize = 1 << ORDER;
/// Physical cells per ring; double the capacity so an enqueuer always
/// finds a claimable cell within bounded tickets.
const RING: usize = 1 << (ORDER + 1);
/// Dequeue-scan budget: an element present in the ring is found within
/// this many failed tickets.
const THRESHOLD: i64 = 3 * CAPACITY as i64 - 1;

/// Safe flag in a double-wide cell's tag word; the rest is the lap count.
const STATUS_BIT: u64 = 1 << 63;
const INDEX_MASK: u64 = !STATUS_BIT;

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

/// Lap a ticket belongs to, counted from 1 so freshly initialised cells
/// (lap 0) read as claimable.
#[inline]
fn ecycle(ticket: u64) -> u64 {
    ticket / RING as u64 + 1
}

/// Operations a bounded SCQ ring offers, shared by both cell layouts.
pub(crate) trait BoundedRing<T>: Sized + Send + Sync {
    fn fresh() -> Self;
    fn with_first(elem: NonNull<T>) -> Self;

    /// Inserts if a slot is available. `NONEMPTY` skips the unconditional
    /// threshold reset in favour of a load-check when the caller knows
    /// the ring already held an element.
    fn try_enqueue<const NONEMPTY: bool>(&self, elem: NonNull<T>) -> bool;

    fn try_dequeue(&self) -> Option<NonNull<T>>;

    /// Re-arms the dequeue-scan budget.
    fn reset_threshold(&self, order: Ordering);
}

/// One segment: a bounded ring plus the successor link.
struct ScqNode<T, R> {
    ring: R,
    next: CachePadded<AtomicPtr<Self>>,
    _marker: std::marker::PhantomData<fn(NonNull<T>)>,
}

impl<T: Send, R: BoundedRing<T>> Segment<T> for ScqNode<T, R> {
    fn fresh() -> Box<Self> {
        Box::new(Self {
            ring: R::fresh(),
            next: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            _marker: std::marker::PhantomData,
        })
    }

    fn with_first(elem: NonNull<T>) -> Box<Self> {
        Box::new(Self {
            ring: R::with_first(elem),
            next: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            _marker: std::marker::PhantomData,
        })
    }

    #[inline]
    fn next(&self) -> &AtomicPtr<Self> {
        &self.next
    }

    #[inline]
    fn try_enqueue(&self, elem: NonNull<T>) -> bool {
        // The hint only elides redundant threshold stores; a first insert
        // into the unseeded sentinel still raises it via the load-check.
        self.ring.try_enqueue::<true>(elem)
    }

    #[inline]
    fn try_dequeue(&self) -> Option<NonNull<T>> {
        self.ring.try_dequeue()
    }

    #[inline]
    fn reset_threshold(&self) {
        self.ring.reset_threshold(Ordering::Release);
    }
}

macro_rules! lscq_queue {
    ($(#[$doc:meta])* $name:ident, $ring:ident) => {
        $(#[$doc])*
        pub struct $name<T: Send> {
            list: SegmentList<T, ScqNode<T, $ring<T>>>,
        }

        impl<T: Send> $name<T> {
            /// Creates a queue sized for [`MAX_THREADS`] threads.
            pub fn new() -> Self {
                Self::with_max_threads(MAX_THREADS)
                    .expect("MAX_THREADS is a valid thread count")
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
            /// `tid` must be in `[0, max_threads)` and exclusive to the
            /// calling thread for the duration of the call.
            pub fn enqueue(&self, elem: NonNull<T>, tid: usize) {
                debug_assert_tid!(tid, self.list.max_threads());
                self.list.enqueue(elem, tid);
            }

            /// Removes the oldest element, or returns `None` if the queue
            /// is observed empty.
            pub fn dequeue(&self, tid: usize) -> Option<NonNull<T>> {
                debug_assert_tid!(tid, self.list.max_threads());
                self.list.dequeue(tid)
            }
        }

        impl<T: Send> Default for $name<T> {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

lscq_queue!(
    /// Lock-free MPMC FIFO over linked SCQ segments with double-wide CAS
    /// cells.
    Lscq2,
    Scq2Ring
);

lscq_queue!(
    /// Lock-free MPMC FIFO over linked SCQ segments with single-wide CAS
    /// cells and an index indirection.
    Lscqd,
    ScqdRing
);

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_of(values: &[u64], i: usize) -> NonNull<u64> {
        NonNull::from(&values[i])
    }

    #[test]
    fn test_lscq2_roundtrip_across_segments() {
        let count = CAPACITY + 1;
        let values: Vec<u64> = (0..count as u64).collect();
        let queue = Lscq2::<u64>::with_max_threads(1).unwrap();

        for i in 0..count {
            queue.enqueue(addr_of(&values, i), 0);
        }
        for i in 0..count {
            let elem = queue.dequeue(0).expect("queue holds all elements");
            assert_eq!(unsafe { *elem.as_ref() }, values[i]);
        }
        assert!(queue.dequeue(0).is_none());
    }

    #[test]
    fn test_lscqd_roundtrip_across_segments() {
        let count = CAPACITY + 1;
        let values: Vec<u64> = (0..count as u64).collect();
        let queue = Lscqd::<u64>::with_max_threads(1).unwrap();

        for i in 0..count {
            queue.enqueue(addr_of(&values, i), 0);
        }
        for i in 0..count {
            let elem = queue.dequeue(0).expect("queue holds all elements");
            assert_eq!(unsafe { *elem.as_ref() }, values[i]);
        }
        assert!(queue.dequeue(0).is_none());
    }

    #[test]
    fn test_empty_queue_stays_empty() {
        let queue = Lscq2::<u64>::with_max_threads(2).unwrap();
        for _ in 0..100 {
            assert!(queue.dequeue(1).is_none());
        }

        let values = vec![11u64];
        queue.enqueue(addr_of(&values, 0), 0);
        assert_eq!(unsafe { *queue.dequeue(1).unwrap().as_ref() }, 11);
    }
}
