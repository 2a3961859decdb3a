//! Fetch-and-add array queue.
//!
//! Implementation of the FAAArrayQueue by Ramalhete & Correia: an unbounded
//! linked list of 1024-slot array segments where producers and consumers
//! claim slots with a single fetch-and-add on the segment's enqueue or
//! dequeue index.
//!
//! A consumer that wins a ticket for a slot no producer has filled yet
//! swaps the `TAKEN` sentinel into it, poisoning the slot: the producer's
//! publishing CAS (null → element) then fails deterministically and the
//! producer moves on to a fresh ticket. This turns the missed-publication
//! race into an abandon signal on both sides.
//!
//! The queue comes in four variants that differ only in the emptiness
//! check consulted at the top of `dequeue` - the exact atomic operations
//! and memory orders of each are load-bearing and preserved verbatim (see
//! [`Emptiness`]).

use crate::error::QueueError;
use crate::hazard::HazardPointers;
use crate::invariants::debug_assert_tid;
use crate::MAX_THREADS;
use crossbeam_utils::CachePadded;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Number of element slots per array segment.
const NODE_SIZE: usize = 1024;

/// Sentinel swapped into a slot by an abandoning consumer. Distinguishable
/// from every legal element address as long as `align_of::<T>() > 1`.
const TAKEN: usize = 0x1;

/// Enqueue and dequeue use the same hazard pointer.
const HP_ENQ_TAIL: usize = 0;
const HP_DEQ_HEAD: usize = 0;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Original {}
    impl Sealed for super::Variant1 {}
    impl Sealed for super::Variant2 {}
    impl Sealed for super::Variant3 {}
}

/// The index half of a segment's emptiness check.
///
/// All four variants additionally require `next` to be null before the
/// queue reports empty; they differ in which index is read with `Acquire`
/// versus `Relaxed`, and whether a fetch-add of zero is used to force a
/// read-modify-write on one of them. The expressions are intentionally not
/// interchangeable and each must be kept exactly as written.
pub trait Emptiness: sealed::Sealed + 'static {
    #[doc(hidden)]
    fn indices_drained(deq_idx: &AtomicU64, enq_idx: &AtomicU64) -> bool;
}

/// `deq_idx (relaxed) ≥ enq_idx (acquire)` - the published algorithm.
pub struct Original;

/// `enq_idx (relaxed) ≤ deq_idx (acquire)` - comparison flipped, acquire
/// moved to the dequeue index.
pub struct Variant1;

/// `enq_idx (relaxed) ≤ deq_idx (fetch_add 0, acquire)` - like
/// [`Variant1`] but forcing an RMW on the dequeue index.
pub struct Variant2;

/// `deq_idx (fetch_add 0, relaxed) ≥ enq_idx (acquire)` - like
/// [`Original`] but forcing an RMW on the dequeue index.
pub struct Variant3;

impl Emptiness for Original {
    #[inline]
    fn indices_drained(deq_idx: &AtomicU64, enq_idx: &AtomicU64) -> bool {
        deq_idx.load(Ordering::Relaxed) >= enq_idx.load(Ordering::Acquire)
    }
}

impl Emptiness for Variant1 {
    #[inline]
    fn indices_drained(deq_idx: &AtomicU64, enq_idx: &AtomicU64) -> bool {
        enq_idx.load(Ordering::Relaxed) <= deq_idx.load(Ordering::Acquire)
    }
}

impl Emptiness for Variant2 {
    #[inline]
    fn indices_drained(deq_idx: &AtomicU64, enq_idx: &AtomicU64) -> bool {
        enq_idx.load(Ordering::Relaxed) <= deq_idx.fetch_add(0, Ordering::Acquire)
    }
}

impl Emptiness for Variant3 {
    #[inline]
    fn indices_drained(deq_idx: &AtomicU64, enq_idx: &AtomicU64) -> bool {
        deq_idx.fetch_add(0, Ordering::Relaxed) >= enq_idx.load(Ordering::Acquire)
    }
}

/// One array segment: ticket indices, slot array, successor link.
struct Node<T> {
    deq_idx: CachePadded<AtomicU64>,
    slots: Box<[AtomicPtr<T>]>,
    enq_idx: CachePadded<AtomicU64>,
    next: CachePadded<AtomicPtr<Node<T>>>,
}

impl<T> Node<T> {
    fn alloc_slots() -> Box<[AtomicPtr<T>]> {
        let mut slots = Vec::with_capacity(NODE_SIZE);
        slots.resize_with(NODE_SIZE, || AtomicPtr::new(ptr::null_mut()));
        slots.into_boxed_slice()
    }

    fn fresh() -> Box<Self> {
        Box::new(Self {
            deq_idx: CachePadded::new(AtomicU64::new(0)),
            slots: Self::alloc_slots(),
            enq_idx: CachePadded::new(AtomicU64::new(0)),
            next: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        })
    }

    /// A segment with `first` pre-filled in slot 0 and the enqueue index
    /// already advanced past it.
    fn with_first(first: NonNull<T>) -> Box<Self> {
        let node = Self {
            deq_idx: CachePadded::new(AtomicU64::new(0)),
            slots: Self::alloc_slots(),
            enq_idx: CachePadded::new(AtomicU64::new(1)),
            next: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        };
        node.slots[0].store(first.as_ptr(), Ordering::Relaxed);
        Box::new(node)
    }

    fn cas_slot(&self, idx: usize, expected: *mut T, desired: *mut T, order: Ordering) -> bool {
        self.slots[idx]
            .compare_exchange(expected, desired, order, Ordering::Relaxed)
            .is_ok()
    }

    fn cas_next(&self, expected: *mut Node<T>, desired: *mut Node<T>, order: Ordering) -> bool {
        self.next
            .compare_exchange(expected, desired, order, Ordering::Relaxed)
            .is_ok()
    }
}

/// Lock-free MPMC FIFO over linked fetch-and-add array segments.
///
/// `V` selects the emptiness-check variant; [`FaaQueue`] is the published
/// algorithm.
pub struct FaaArrayQueue<T, V: Emptiness = Original> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    hazards: CachePadded<HazardPointers<Node<T>>>,
    _variant: PhantomData<V>,
}

/// The published emptiness check.
pub type FaaQueue<T> = FaaArrayQueue<T, Original>;
/// Emptiness variant 1.
pub type FaaQueueV1<T> = FaaArrayQueue<T, Variant1>;
/// Emptiness variant 2.
pub type FaaQueueV2<T> = FaaArrayQueue<T, Variant2>;
/// Emptiness variant 3.
pub type FaaQueueV3<T> = FaaArrayQueue<T, Variant3>;

// Safety: the queue only stores and hands back element addresses; segment
// internals are synchronized through atomics and the hazard domain.
unsafe impl<T: Send, V: Emptiness> Send for FaaArrayQueue<T, V> {}
unsafe impl<T: Send, V: Emptiness> Sync for FaaArrayQueue<T, V> {}

impl<T, V: Emptiness> FaaArrayQueue<T, V> {
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
        assert!(
            mem::align_of::<T>() > 1,
            "element alignment must exceed 1 so the TAKEN sentinel cannot alias an element"
        );

        let sentinel = Box::into_raw(Node::fresh());
        Ok(Self {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
            hazards: CachePadded::new(HazardPointers::new(max_threads)),
            _variant: PhantomData,
        })
    }

    /// Appends `elem` to the queue.
    ///
    /// `tid` must be in `[0, max_threads)` and exclusive to the calling
    /// thread for the duration of the call.
    pub fn enqueue(&self, elem: NonNull<T>, tid: usize) {
        debug_assert_tid!(tid, self.hazards.max_threads());

        loop {
            let tail = self
                .hazards
                .protect_ptr(self.tail.load(Ordering::Relaxed), tid, HP_ENQ_TAIL);
            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }

            // SAFETY: `tail` is protected and the verifying re-read
            // succeeded, so it cannot have been retired since.
            let tail_ref = unsafe { &*tail };

            let idx = tail_ref.enq_idx.fetch_add(1, Ordering::Relaxed) as usize;
            if idx < NODE_SIZE {
                // ** fast path ** publish the element into the ticketed slot
                if tail_ref.cas_slot(idx, ptr::null_mut(), elem.as_ptr(), Ordering::Release) {
                    break;
                }
                // A consumer poisoned the slot; take a fresh ticket.
                continue;
            }

            // ** slow path ** append a new tail segment or help advance
            if tail != self.tail.load(Ordering::Relaxed) {
                continue;
            }

            let next = tail_ref.next.load(Ordering::Acquire);
            if next.is_null() {
                let node = Box::into_raw(Node::with_first(elem));
                if tail_ref.cas_next(ptr::null_mut(), node, Ordering::Release) {
                    self.cas_tail(tail, node, Ordering::Release);
                    break;
                }
                // SAFETY: the append lost; `node` never became reachable.
                unsafe { drop(Box::from_raw(node)) };
            } else {
                self.cas_tail(tail, next, Ordering::Release);
            }
        }

        self.hazards.clear_one(tid, HP_ENQ_TAIL);
    }

    /// Removes the oldest element, or returns `None` if the queue is
    /// observed empty.
    pub fn dequeue(&self, tid: usize) -> Option<NonNull<T>> {
        debug_assert_tid!(tid, self.hazards.max_threads());

        let result = loop {
            let head = self
                .hazards
                .protect_ptr(self.head.load(Ordering::Relaxed), tid, HP_DEQ_HEAD);
            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            // SAFETY: `head` is protected and verified, as in `enqueue`.
            let head_ref = unsafe { &*head };

            // Consult the emptiness check before spending a ticket, so a
            // drained queue does not advance `deq_idx` unboundedly.
            if Self::is_empty(head_ref) {
                break None;
            }

            let idx = head_ref.deq_idx.fetch_add(1, Ordering::Relaxed) as usize;
            if idx < NODE_SIZE {
                // ** fast path ** claim the ticketed slot, poisoning it if
                // the producer has not published yet
                let prev = head_ref.slots[idx].swap(TAKEN as *mut T, Ordering::Acquire);
                if let Some(elem) = NonNull::new(prev) {
                    break Some(elem);
                }
                // Empty slot poisoned; abandon it and retry.
                continue;
            }

            // ** slow path ** advance head to the successor segment
            let next = head_ref.next.load(Ordering::Acquire);
            if next.is_null() {
                break None;
            }
            if self.cas_head(head, next, Ordering::Release) {
                self.hazards.retire(head, tid);
            }
        };

        self.hazards.clear_one(tid, HP_DEQ_HEAD);
        result
    }

    fn is_empty(head: &Node<T>) -> bool {
        V::indices_drained(&head.deq_idx, &head.enq_idx)
            && head.next.load(Ordering::Acquire).is_null()
    }

    fn cas_head(&self, expected: *mut Node<T>, desired: *mut Node<T>, order: Ordering) -> bool {
        self.head
            .compare_exchange(expected, desired, order, Ordering::Relaxed)
            .is_ok()
    }

    fn cas_tail(&self, expected: *mut Node<T>, desired: *mut Node<T>, order: Ordering) -> bool {
        self.tail
            .compare_exchange(expected, desired, order, Ordering::Relaxed)
            .is_ok()
    }
}

impl<T, V: Emptiness> Default for FaaArrayQueue<T, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, V: Emptiness> Drop for FaaArrayQueue<T, V> {
    fn drop(&mut self) {
        // Elements are opaque borrowed addresses; only segments are freed.
        let mut curr = *self.head.get_mut();
        while !curr.is_null() {
            // SAFETY: reachable segments came from `Box::into_raw`;
            // unlinked ones belong to the hazard domain.
            let node = unsafe { Box::from_raw(curr) };
            curr = node.next.load(Ordering::Relaxed);
        }
    }
}
