//! Property-based tests.
//!
//! Single-threaded operation sequences are checked against a `VecDeque`
//! model: the queues must agree with the model on every dequeue result,
//! which implies the subset/no-duplicate law, per-producer FIFO and that
//! a drained queue stays drained. The four FAA emptiness variants are
//! additionally fuzzed separately under real contention, since their
//! memory orderings differ and a bug in one must not hide behind the
//! others.

use proptest::prelude::*;
use std::collections::{HashSet, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// The queue surface the generic property bodies drive.
trait Mpmc: Sized + Sync {
    fn with_threads(max_threads: usize) -> Self;
    fn enqueue(&self, elem: NonNull<u64>, tid: usize);
    fn dequeue(&self, tid: usize) -> Option<NonNull<u64>>;
}

macro_rules! impl_mpmc {
    ($queue:ty) => {
        impl Mpmc for $queue {
            fn with_threads(max_threads: usize) -> Self {
                <$queue>::with_max_threads(max_threads).unwrap()
            }
            fn enqueue(&self, elem: NonNull<u64>, tid: usize) {
                <$queue>::enqueue(self, elem, tid);
            }
            fn dequeue(&self, tid: usize) -> Option<NonNull<u64>> {
                <$queue>::dequeue(self, tid)
            }
        }
    };
}

impl_mpmc!(segq_rs::FaaQueue<u64>);
impl_mpmc!(segq_rs::FaaQueueV1<u64>);
impl_mpmc!(segq_rs::FaaQueueV2<u64>);
impl_mpmc!(segq_rs::FaaQueueV3<u64>);
impl_mpmc!(segq_rs::Lcrq<u64>);
impl_mpmc!(segq_rs::Lscq2<u64>);
impl_mpmc!(segq_rs::Lscqd<u64>);
impl_mpmc!(segq_rs::MsQueue<u64>);

/// Replays an enqueue/dequeue sequence against a `VecDeque` of the same
/// addresses; every dequeue must match the model exactly.
fn check_against_model<Q: Mpmc>(ops: &[bool]) {
    let values: Vec<u64> = (0..ops.len() as u64).collect();
    let queue = Q::with_threads(1);
    let mut model: VecDeque<*const u64> = VecDeque::new();
    let mut next = 0usize;

    for &is_enqueue in ops {
        if is_enqueue {
            let elem = NonNull::from(&values[next]);
            queue.enqueue(elem, 0);
            model.push_back(elem.as_ptr().cast_const());
            next += 1;
        } else {
            let expected = model.pop_front();
            let actual = queue.dequeue(0).map(|e| e.as_ptr().cast_const());
            assert_eq!(actual, expected, "queue disagrees with FIFO model");
        }
    }

    // Drain: the tail of the model must come out in order, then empty.
    while let Some(expected) = model.pop_front() {
        let actual = queue.dequeue(0).map(|e| e.as_ptr().cast_const());
        assert_eq!(actual, Some(expected));
    }
    assert!(queue.dequeue(0).is_none());
}

macro_rules! model_suite {
    ($test_name:ident, $queue:ty) => {
        proptest! {
            #[test]
            fn $test_name(ops in prop::collection::vec(prop::bool::ANY, 1..200)) {
                check_against_model::<$queue>(&ops);
            }
        }
    };
}

model_suite!(prop_model_faa, segq_rs::FaaQueue<u64>);
model_suite!(prop_model_faa_v1, segq_rs::FaaQueueV1<u64>);
model_suite!(prop_model_faa_v2, segq_rs::FaaQueueV2<u64>);
model_suite!(prop_model_faa_v3, segq_rs::FaaQueueV3<u64>);
model_suite!(prop_model_lcrq, segq_rs::Lcrq<u64>);
model_suite!(prop_model_lscq2, segq_rs::Lscq2<u64>);
model_suite!(prop_model_lscqd, segq_rs::Lscqd<u64>);
model_suite!(prop_model_msq, segq_rs::MsQueue<u64>);

/// Concurrent burst: two producers and two consumers race over a small
/// element count, with consumers also probing while the queue runs dry.
/// Checks the subset/no-duplicate law and that nothing is left behind.
fn fuzz_empty_race<Q: Mpmc>(count: usize) {
    let queue = Q::with_threads(4);
    let elements: Vec<Vec<u64>> = (0..2).map(|_| (0..count as u64).collect()).collect();
    let start = AtomicBool::new(false);

    let collected = thread::scope(|s| {
        for tid in 0..2 {
            let queue = &queue;
            let start = &start;
            let values = &elements[tid];
            s.spawn(move || {
                while !start.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                for value in values {
                    queue.enqueue(NonNull::from(value), tid);
                }
            });
        }

        let consumers: Vec<_> = (2..4)
            .map(|tid| {
                let queue = &queue;
                let start = &start;
                s.spawn(move || {
                    while !start.load(Ordering::Acquire) {
                        std::hint::spin_loop();
                    }
                    let mut seen = Vec::new();
                    // Interleave successful dequeues with empty probes;
                    // stop after a run of failures once producers are
                    // plausibly done.
                    let mut dry_runs = 0usize;
                    while dry_runs < 1000 {
                        if let Some(elem) = queue.dequeue(tid) {
                            seen.push(elem.as_ptr() as usize);
                            dry_runs = 0;
                        } else {
                            dry_runs += 1;
                        }
                    }
                    seen
                })
            })
            .collect();

        start.store(true, Ordering::Release);
        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.join().unwrap());
        }
        all
    });

    // Whatever was dequeued is a real element, dequeued at most once.
    let valid: HashSet<usize> = elements
        .iter()
        .flat_map(|v| v.iter().map(|value| value as *const u64 as usize))
        .collect();
    let mut unique = HashSet::new();
    for addr in &collected {
        assert!(valid.contains(addr), "phantom element dequeued");
        assert!(unique.insert(*addr), "element dequeued twice");
    }

    // The consumers gave up only after long dry runs; collect stragglers
    // single-threadedly and require full coverage.
    let mut total = collected.len();
    while let Some(elem) = queue.dequeue(0) {
        assert!(unique.insert(elem.as_ptr() as usize), "element dequeued twice");
        total += 1;
    }
    assert_eq!(total, 2 * count, "elements lost");
}

macro_rules! empty_race_suite {
    ($test_name:ident, $queue:ty) => {
        #[test]
        fn $test_name() {
            for _ in 0..50 {
                fuzz_empty_race::<$queue>(64);
            }
        }
    };
}

empty_race_suite!(fuzz_empty_race_faa, segq_rs::FaaQueue<u64>);
empty_race_suite!(fuzz_empty_race_faa_v1, segq_rs::FaaQueueV1<u64>);
empty_race_suite!(fuzz_empty_race_faa_v2, segq_rs::FaaQueueV2<u64>);
empty_race_suite!(fuzz_empty_race_faa_v3, segq_rs::FaaQueueV3<u64>);
