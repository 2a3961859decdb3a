//! SCQD - bounded scalable circular queue over single-wide cells.
//!
//! Pointers do not fit a tagged 64-bit word next to a cycle, so the
//! bounded queue is composed out of two *index* rings over a data array:
//! a free ring (`fq`, initially holding every slot index) and an
//! allocated ring (`aq`, initially empty). Enqueue pops a free slot,
//! writes the element into it and pushes the slot onto `aq`; dequeue pops
//! `aq`, reads the slot and recycles it through `fq`.
//!
//! Each index ring runs the same cycle/safe/threshold protocol as the
//! double-wide ring, but an entry packs `{safe, cycle, index}` into one
//! `u64` and is claimed with an ordinary CAS. At most CAPACITY indices
//! circulate through a 2·CAPACITY ring, so pushing an index can never
//! fail and neither ring is ever closed.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::{ecycle, BoundedRing, CAPACITY, RING, THRESHOLD};

/// Entry layout: bit 63 = safe, bits [62:12] = cycle, bits [11:0] = index.
const SAFE_BIT: u64 = 1 << 63;
const IDX_BITS: u32 = 12;
const IDX_MASK: u64 = (1 << IDX_BITS) - 1;
/// Index value meaning "no index stored".
const EMPTY_IDX: u64 = IDX_MASK;

#[inline]
fn pack(safe: bool, cycle: u64, idx: u64) -> u64 {
    debug_assert!(idx <= IDX_MASK);
    let entry = (cycle << IDX_BITS) | idx;
    if safe {
        SAFE_BIT | entry
    } else {
        entry
    }
}

#[inline]
fn unpack(entry: u64) -> (bool, u64, u64) {
    (
        entry & SAFE_BIT != 0,
        (entry & !SAFE_BIT) >> IDX_BITS,
        entry & IDX_MASK,
    )
}

/// A ring of slot indices with the SCQ threshold protocol.
struct IndexRing {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    threshold: CachePadded<AtomicI64>,
    entries: Box<[CachePadded<AtomicU64>]>,
}

impl IndexRing {
    /// An empty ring: every entry at cycle 0 with no index.
    fn fresh_empty() -> Self {
        let mut entries = Vec::with_capacity(RING);
        entries.resize_with(RING, || {
            CachePadded::new(AtomicU64::new(pack(true, 0, EMPTY_IDX)))
        });
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            threshold: CachePadded::new(AtomicI64::new(-1)),
            entries: entries.into_boxed_slice(),
        }
    }

    /// A full ring: indices `0..CAPACITY` pre-enqueued at tickets
    /// `0..CAPACITY` (cycle 1), tail advanced past them.
    fn fresh_full() -> Self {
        let mut entries = Vec::with_capacity(RING);
        for idx in 0..CAPACITY as u64 {
            entries.push(CachePadded::new(AtomicU64::new(pack(true, 1, idx))));
        }
        entries.resize_with(RING, || {
            CachePadded::new(AtomicU64::new(pack(true, 0, EMPTY_IDX)))
        });
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(CAPACITY as u64)),
            threshold: CachePadded::new(AtomicI64::new(THRESHOLD)),
            entries: entries.into_boxed_slice(),
        }
    }

    /// Pushes `idx` onto the ring. Cannot fail: at most CAPACITY indices
    /// circulate through 2·CAPACITY entries, so a claimable entry always
    /// turns up within bounded tickets.
    fn enqueue<const NONEMPTY: bool>(&self, idx: u64) {
        loop {
            let ticket = self.tail.fetch_add(1, Ordering::SeqCst);
            let entry = &self.entries[ticket as usize % RING];
            let current = entry.load(Ordering::SeqCst);
            let (safe, cycle, stored) = unpack(current);

            if stored == EMPTY_IDX
                && cycle < ecycle(ticket)
                && (safe || self.head.load(Ordering::SeqCst) <= ticket)
            {
                let desired = pack(true, ecycle(ticket), idx);
                if entry
                    .compare_exchange_weak(current, desired, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if !NONEMPTY {
                        self.threshold.store(THRESHOLD, Ordering::SeqCst);
                    } else if self.threshold.load(Ordering::SeqCst) != THRESHOLD {
                        self.threshold.store(THRESHOLD, Ordering::SeqCst);
                    }
                    return;
                }
            }
            // Lost the entry; take a fresh ticket.
        }
    }

    fn dequeue(&self) -> Option<u64> {
        if self.threshold.load(Ordering::SeqCst) < 0 {
            return None;
        }

        loop {
            let ticket = self.head.fetch_add(1, Ordering::SeqCst);
            let entry = &self.entries[ticket as usize % RING];
            let expected_cycle = ecycle(ticket);

            loop {
                let current = entry.load(Ordering::SeqCst);
                let (safe, cycle, stored) = unpack(current);

                if cycle == expected_cycle {
                    if stored == EMPTY_IDX {
                        break;
                    }
                    // Consume: blank the index, keep the lap and safe bit.
                    let desired = pack(safe, cycle, EMPTY_IDX);
                    if entry
                        .compare_exchange_weak(
                            current,
                            desired,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        return Some(stored);
                    }
                } else if cycle < expected_cycle {
                    let desired = if stored == EMPTY_IDX {
                        // Empty transition.
                        pack(safe, expected_cycle, EMPTY_IDX)
                    } else {
                        // Straggler from an earlier lap: mark unsafe.
                        pack(false, cycle, stored)
                    };
                    if entry
                        .compare_exchange_weak(
                            current,
                            desired,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        break;
                    }
                } else {
                    break;
                }
            }

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

    fn reset_threshold(&self, order: Ordering) {
        self.threshold.store(THRESHOLD, order);
    }
}

/// Bounded pointer queue composed of the two index rings and the data
/// array they arbitrate.
pub(crate) struct ScqdRing<T> {
    aq: IndexRing,
    fq: IndexRing,
    data: Box<[UnsafeCell<*mut T>]>,
}

// Safety: a data slot is owned by exactly one thread at a time - the
// enqueuer that popped its index from `fq` until the push onto `aq`, then
// the dequeuer that popped it from `aq` until the push back onto `fq` -
// and ownership transfer is ordered by the rings' entry CASes.
unsafe impl<T: Send> Send for ScqdRing<T> {}
unsafe impl<T: Send> Sync for ScqdRing<T> {}

impl<T: Send> BoundedRing<T> for ScqdRing<T> {
    fn fresh() -> Self {
        let mut data = Vec::with_capacity(CAPACITY);
        data.resize_with(CAPACITY, || UnsafeCell::new(ptr::null_mut()));
        Self {
            aq: IndexRing::fresh_empty(),
            fq: IndexRing::fresh_full(),
            data: data.into_boxed_slice(),
        }
    }

    fn with_first(elem: NonNull<T>) -> Self {
        let ring = Self::fresh();
        let seeded = ring.try_enqueue::<false>(elem);
        debug_assert!(seeded, "a fresh ring accepts its seed element");
        ring
    }

    fn try_enqueue<const NONEMPTY: bool>(&self, elem: NonNull<T>) -> bool {
        let Some(idx) = self.fq.dequeue() else {
            // No free slot: the segment is full.
            return false;
        };

        // SAFETY: popping `idx` from fq grants exclusive ownership of the
        // slot until it is pushed onto aq.
        unsafe { *self.data[idx as usize].get() = elem.as_ptr() };

        self.aq.enqueue::<NONEMPTY>(idx);
        true
    }

    fn try_dequeue(&self) -> Option<NonNull<T>> {
        let idx = self.aq.dequeue()?;

        // SAFETY: popping `idx` from aq grants exclusive ownership of the
        // slot; the enqueuer's write is ordered before its aq entry CAS.
        let elem = unsafe { *self.data[idx as usize].get() };

        self.fq.enqueue::<false>(idx);
        NonNull::new(elem)
    }

    fn reset_threshold(&self, order: Ordering) {
        self.aq.reset_threshold(order);
    }
}

// Capacity must fit the entry index field, sentinel excluded.
const _: () = assert!((CAPACITY as u64) < EMPTY_IDX);
