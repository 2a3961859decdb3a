//! Michael–Scott queue.
//!
//! The classic two-pointer linked queue of Michael & Scott (PODC '96),
//! one element per node. Kept as a baseline only; it does not use the
//! segmented shell. Dequeue needs two hazard pointers - one for the head
//! node and one for its successor - because the element is read out of
//! the successor after the head CAS.

use crate::error::QueueError;
use crate::hazard::HazardPointers;
use crate::invariants::debug_assert_tid;
use crate::MAX_THREADS;
use crossbeam_utils::CachePadded;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

const HP_ENQ_TAIL: usize = 0;
const HP_DEQ_HEAD: usize = 0;
const HP_DEQ_NEXT: usize = 1;

/// Retire-scan threshold for the two-slot domain.
const SCAN_THRESHOLD: usize = 100;

struct MsNode<T> {
    elem: *mut T,
    next: AtomicPtr<MsNode<T>>,
}

// Safety: `elem` is an opaque address the queue never dereferences.
unsafe impl<T: Send> Send for MsNode<T> {}

/// Lock-free MPMC FIFO with one element per linked node.
pub struct MsQueue<T: Send> {
    head: CachePadded<AtomicPtr<MsNode<T>>>,
    tail: CachePadded<AtomicPtr<MsNode<T>>>,
    hazards: CachePadded<HazardPointers<MsNode<T>>>,
}

// Safety: the queue only stores and hands back element addresses; nodes
// are synchronized through atomics and the hazard domain.
unsafe impl<T: Send> Send for MsQueue<T> {}
unsafe impl<T: Send> Sync for MsQueue<T> {}

impl<T: Send> MsQueue<T> {
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

        let sentinel = Box::into_raw(Box::new(MsNode {
            elem: ptr::null_mut(),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        Ok(Self {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
            hazards: CachePadded::new(HazardPointers::with_scan_threshold(
                max_threads,
                2,
                SCAN_THRESHOLD,
            )),
        })
    }

    /// Appends `elem` to the queue.
    ///
    /// `tid` must be in `[0, max_threads)` and exclusive to the calling
    /// thread for the duration of the call.
    pub fn enqueue(&self, elem: NonNull<T>, tid: usize) {
        debug_assert_tid!(tid, self.hazards.max_threads());

        let node = Box::into_raw(Box::new(MsNode {
            elem: elem.as_ptr(),
            next: AtomicPtr::new(ptr::null_mut()),
        }));

        loop {
            let tail = self
                .hazards
                .protect_ptr(self.tail.load(Ordering::Relaxed), tid, HP_ENQ_TAIL);
            if self.tail.load(Ordering::Acquire) != tail {
                continue;
            }

            // SAFETY: `tail` is protected and the verifying re-read
            // succeeded.
            let tail_ref = unsafe { &*tail };
            match tail_ref.next.compare_exchange(
                ptr::null_mut(),
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.cas_tail(tail, node, Ordering::Release);
                    break;
                }
                Err(observed) => {
                    // Someone linked first; help advance the tail.
                    self.cas_tail(tail, observed, Ordering::Release);
                }
            }
        }

        self.hazards.clear_one(tid, HP_ENQ_TAIL);
    }

    /// Removes the oldest element, or returns `None` if the queue is
    /// observed empty.
    pub fn dequeue(&self, tid: usize) -> Option<NonNull<T>> {
        debug_assert_tid!(tid, self.hazards.max_threads());

        let mut head = self.hazards.protect(&self.head, tid, HP_DEQ_HEAD);

        while head != self.tail.load(Ordering::Acquire) {
            // The head is not the last node, so its successor is linked.
            // SAFETY: `head` is protected by HP_DEQ_HEAD.
            let next = self
                .hazards
                .protect(unsafe { &(*head).next }, tid, HP_DEQ_NEXT);

            if self.cas_head(head, next, Ordering::Acquire) {
                // SAFETY: `next` is protected by HP_DEQ_NEXT and is now
                // the sentinel; its element belongs to us.
                let res = unsafe { (*next).elem };
                self.hazards.clear(tid);
                self.hazards.retire(head, tid);
                return NonNull::new(res);
            }

            head = self.hazards.protect(&self.head, tid, HP_DEQ_HEAD);
        }

        self.hazards.clear(tid);
        None
    }

    fn cas_head(&self, expected: *mut MsNode<T>, desired: *mut MsNode<T>, order: Ordering) -> bool {
        self.head
            .compare_exchange(expected, desired, order, Ordering::Relaxed)
            .is_ok()
    }

    fn cas_tail(&self, expected: *mut MsNode<T>, desired: *mut MsNode<T>, order: Ordering) -> bool {
        self.tail
            .compare_exchange(expected, desired, order, Ordering::Relaxed)
            .is_ok()
    }
}

impl<T: Send> Default for MsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Drop for MsQueue<T> {
    fn drop(&mut self) {
        // Elements are opaque borrowed addresses; only nodes are freed.
        let mut curr = *self.head.get_mut();
        while !curr.is_null() {
            // SAFETY: reachable nodes came from `Box::into_raw`; unlinked
            // ones belong to the hazard domain.
            let node = unsafe { Box::from_raw(curr) };
            curr = node.next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_of(values: &[u64], i: usize) -> NonNull<u64> {
        NonNull::from(&values[i])
    }

    #[test]
    fn test_roundtrip_preserves_order() {
        let values: Vec<u64> = (0..32).collect();
        let queue = MsQueue::<u64>::with_max_threads(1).unwrap();

        for i in 0..32 {
            queue.enqueue(addr_of(&values, i), 0);
        }
        for i in 0..32 {
            let elem = queue.dequeue(0).expect("queue holds 32 elements");
            assert_eq!(unsafe { *elem.as_ref() }, values[i]);
        }
        assert!(queue.dequeue(0).is_none());
    }

    #[test]
    fn test_empty_then_refill() {
        let values = vec![1u64, 2];
        let queue = MsQueue::<u64>::with_max_threads(2).unwrap();

        assert!(queue.dequeue(0).is_none());
        queue.enqueue(addr_of(&values, 0), 0);
        queue.enqueue(addr_of(&values, 1), 1);
        assert_eq!(unsafe { *queue.dequeue(1).unwrap().as_ref() }, 1);
        assert_eq!(unsafe { *queue.dequeue(0).unwrap().as_ref() }, 2);
        assert!(queue.dequeue(0).is_none());
    }
}
