//! Segmented-list shell shared by the ring-based queues.
//!
//! An unbounded FIFO is built as a singly-linked list of bounded segments.
//! Producers operate on the tail segment, consumers on the head segment;
//! when a segment fills (or closes) a producer links a successor seeded
//! with its element, and when a segment drains with a successor present a
//! consumer unlinks it and retires it through the hazard-pointer domain.
//!
//! The shell is parametric over a segment capability set rather than a
//! concrete ring, so LCRQ and both SCQ flavours share one implementation.
//!
//! # Memory Ordering Protocol
//!
//! - `Release` on every CAS that links a segment (`next`, `tail`) or
//!   unlinks one (`head`), pairing with `Acquire` loads of the same
//!   atomics: whatever was written into a freshly linked segment
//!   (including its seed element) is visible to the thread that observes
//!   the link.
//! - The first `next` read on the dequeue empty check is `Relaxed`; it is
//!   only a hint. The `Acquire` re-read before the head CAS is what the
//!   unlink actually relies on.
//! - Hazard publication uses the publish-before-verify protocol of
//!   [`crate::hazard`].

use crate::hazard::HazardPointers;
use crossbeam_utils::CachePadded;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// Capability set a bounded segment offers to the shell.
///
/// `reset_threshold` defaults to a no-op; only segments that gate their
/// dequeue on a threshold counter (SCQ) override it. Segments are shared
/// by reference across every participating thread, hence `Send + Sync`.
pub(crate) trait Segment<T>: Sized + Send + Sync {
    /// Creates an empty segment (the initial sentinel).
    fn fresh() -> Box<Self>;

    /// Creates a segment already holding `elem` (slow-path append).
    fn with_first(elem: NonNull<T>) -> Box<Self>;

    /// The write-once link to the successor segment.
    fn next(&self) -> &AtomicPtr<Self>;

    /// Attempts to insert into the bounded segment. `false` means the
    /// segment is full or closed and a successor must be appended.
    fn try_enqueue(&self, elem: NonNull<T>) -> bool;

    /// Attempts to remove from the bounded segment. `None` means the
    /// segment is (currently) drained.
    fn try_dequeue(&self) -> Option<NonNull<T>>;

    /// Gives a drained segment one final chance to surrender stragglers
    /// before it is unlinked and retired.
    fn reset_threshold(&self) {}
}

/// Enqueue and dequeue use the same hazard pointer.
const HP_ENQ_TAIL: usize = 0;
const HP_DEQ_HEAD: usize = 0;

/// The segmented-list shell: head/tail into the segment list plus the
/// hazard-pointer domain that retires unlinked segments.
pub(crate) struct SegmentList<T, N: Segment<T>> {
    head: CachePadded<AtomicPtr<N>>,
    tail: CachePadded<AtomicPtr<N>>,
    hazards: CachePadded<HazardPointers<N>>,
    _marker: PhantomData<fn(NonNull<T>) -> Option<NonNull<T>>>,
}

impl<T, N: Segment<T>> SegmentList<T, N> {
    pub(crate) fn new(max_threads: usize) -> Self {
        let sentinel = Box::into_raw(N::fresh());
        Self {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
            hazards: CachePadded::new(HazardPointers::new(max_threads)),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn max_threads(&self) -> usize {
        self.hazards.max_threads()
    }

    pub(crate) fn enqueue(&self, elem: NonNull<T>, tid: usize) {
        loop {
            let tail = self
                .hazards
                .protect_ptr(self.tail.load(Ordering::Relaxed), tid, HP_ENQ_TAIL);
            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }

            // SAFETY: `tail` was protected before the verifying re-read
            // succeeded, so it cannot have been retired since.
            let tail_ref = unsafe { &*tail };

            // Help advance a lagging tail before trying to insert.
            let next = tail_ref.next().load(Ordering::Acquire);
            if !next.is_null() {
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                continue;
            }

            if tail_ref.try_enqueue(elem) {
                break;
            }

            // Bounded segment is full or closed: append a successor seeded
            // with the element.
            let node = Box::into_raw(N::with_first(elem));
            match tail_ref.next().compare_exchange(
                ptr::null_mut(),
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let _ = self.tail.compare_exchange(
                        tail,
                        node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    break;
                }
                Err(_) => {
                    // Lost the append race; the element is still ours.
                    // SAFETY: `node` never became reachable.
                    unsafe { drop(Box::from_raw(node)) };
                }
            }
        }

        self.hazards.clear_one(tid, HP_ENQ_TAIL);
    }

    /// Runs `f` against the hazard-protected head segment.
    ///
    /// Observation only: `f` must not unlink or retire anything.
    pub(crate) fn with_head<R>(&self, tid: usize, f: impl FnOnce(&N) -> R) -> R {
        let result = loop {
            let head = self
                .hazards
                .protect_ptr(self.head.load(Ordering::Relaxed), tid, HP_DEQ_HEAD);
            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            // SAFETY: `head` is protected and verified, as in `dequeue`.
            break f(unsafe { &*head });
        };

        self.hazards.clear_one(tid, HP_DEQ_HEAD);
        result
    }

    pub(crate) fn dequeue(&self, tid: usize) -> Option<NonNull<T>> {
        let result = loop {
            let head = self
                .hazards
                .protect_ptr(self.head.load(Ordering::Relaxed), tid, HP_DEQ_HEAD);
            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            // SAFETY: `head` is protected and verified, as above.
            let head_ref = unsafe { &*head };

            if let Some(elem) = head_ref.try_dequeue() {
                break Some(elem);
            }

            if head_ref.next().load(Ordering::Relaxed).is_null() {
                break None;
            }

            // A successor exists, so this segment will never be enqueued
            // into again: give it a final chance to surrender stragglers,
            // then unlink it.
            head_ref.reset_threshold();
            if let Some(elem) = head_ref.try_dequeue() {
                break Some(elem);
            }

            let next = head_ref.next().load(Ordering::Acquire);
            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.hazards.retire(head, tid);
            }
        };

        self.hazards.clear_one(tid, HP_DEQ_HEAD);
        result
    }
}

impl<T, N: Segment<T>> Drop for SegmentList<T, N> {
    fn drop(&mut self) {
        // Destruction requires quiescence. Elements are opaque borrowed
        // addresses and are never freed here; only segment storage is.
        let mut curr = *self.head.get_mut();
        while !curr.is_null() {
            // SAFETY: every reachable segment came from `Box::into_raw`
            // and unlinked segments were handed to the hazard domain,
            // which frees them when it drops.
            let node = unsafe { Box::from_raw(curr) };
            curr = node.next().load(Ordering::Relaxed);
        }
    }
}
