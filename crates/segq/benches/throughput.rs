use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use segq_rs::{FaaQueue, Lcrq, Lscq2, Lscqd, MsQueue};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

const MSG_PER_PRODUCER: u64 = 100_000;

/// Enqueue/dequeue pairs: `n` producers race `n` consumers until every
/// message has crossed the queue once.
fn run_pairs<Q, E, D>(queue: &Q, values: &[Vec<u64>], n: usize, enqueue: E, dequeue: D)
where
    Q: Sync,
    E: Fn(&Q, NonNull<u64>, usize) + Sync,
    D: Fn(&Q, usize) -> Option<NonNull<u64>> + Sync,
{
    let start = AtomicBool::new(false);

    thread::scope(|s| {
        for tid in 0..n {
            let start = &start;
            let enqueue = &enqueue;
            let producer_values = &values[tid];
            s.spawn(move || {
                while !start.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                for value in producer_values {
                    enqueue(queue, NonNull::from(value), tid);
                }
            });

            let deq_tid = n + tid;
            let start = &start;
            let dequeue = &dequeue;
            s.spawn(move || {
                while !start.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                let mut received = 0u64;
                while received < MSG_PER_PRODUCER {
                    if let Some(elem) = dequeue(queue, deq_tid) {
                        black_box(elem);
                        received += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            });
        }
        start.store(true, Ordering::Release);
    });
}

macro_rules! bench_queue {
    ($group:expr, $name:literal, $queue:ty, $n:expr, $values:expr) => {
        $group.bench_with_input(BenchmarkId::new($name, $n), &$n, |b, &n| {
            b.iter(|| {
                let queue = <$queue>::with_max_threads(2 * n).unwrap();
                run_pairs(
                    &queue,
                    $values,
                    n,
                    |q, e, t| q.enqueue(e, t),
                    |q, t| q.dequeue(t),
                );
            });
        });
    };
}

fn bench_pairs(c: &mut Criterion) {
    let mut group = c.benchmark_group("pairs");

    for &n in &[1usize, 2, 4] {
        let values: Vec<Vec<u64>> = (0..n)
            .map(|_| (0..MSG_PER_PRODUCER).collect())
            .collect();
        group.throughput(Throughput::Elements(MSG_PER_PRODUCER * n as u64));

        bench_queue!(group, "faa", FaaQueue<u64>, n, &values);
        bench_queue!(group, "lcrq", Lcrq<u64>, n, &values);
        bench_queue!(group, "lscq2", Lscq2<u64>, n, &values);
        bench_queue!(group, "lscqd", Lscqd<u64>, n, &values);
        bench_queue!(group, "msq", MsQueue<u64>, n, &values);
    }

    group.finish();
}

criterion_group!(benches, bench_pairs);
criterion_main!(benches);
