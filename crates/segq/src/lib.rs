//! SegQ - Lock-Free Segmented MPMC Queues
//!
//! A family of multi-producer multi-consumer FIFO queues built as an
//! unbounded linked list of bounded segments, with hazard-pointer memory
//! reclamation. Threads cooperate through atomics on the list head/tail
//! and on per-segment state; no operation ever blocks on a lock.
//!
//! # Queue Types
//!
//! - [`FaaQueue`] (and its emptiness-check variants [`FaaQueueV1`],
//!   [`FaaQueueV2`], [`FaaQueueV3`]) - fetch-and-add array segments
//!   (Ramalhete & Correia)
//! - [`Lcrq`] - cyclic ring segments with double-wide CAS and closing
//!   semantics (Morrison & Afek)
//! - [`Lscq2`] / [`Lscqd`] - scalable circular queue segments with a
//!   double-wide or single-wide CAS cell layout (Nikolaev)
//! - [`MsQueue`] - the classic Michael–Scott queue, as a baseline
//!
//! Elements are opaque non-null addresses: the queues store and return
//! [`std::ptr::NonNull`] pointers and never read through them. Callers
//! own the pointees and must keep them alive while enqueued.
//!
//! # Thread Ids
//!
//! Every operation takes a `tid` in `[0, max_threads)` that indexes the
//! queue's hazard-pointer slots. A `tid` must be exclusive to its thread
//! for the duration of each call; this is asserted in debug builds.
//!
//! # Example
//!
//! ```
//! use segq_rs::Lcrq;
//! use std::ptr::NonNull;
//!
//! let values: Vec<u64> = (0..3).collect();
//! let queue = Lcrq::<u64>::with_max_threads(1).unwrap();
//!
//! for value in &values {
//!     queue.enqueue(NonNull::from(value), 0);
//! }
//! while let Some(elem) = queue.dequeue(0) {
//!     println!("{}", unsafe { *elem.as_ref() });
//! }
//! ```

mod dwcas;
mod error;
mod faa;
mod hazard;
mod invariants;
mod lcrq;
mod list;
mod msq;
mod scq;

/// Upper bound on the thread count any queue can be constructed for.
pub const MAX_THREADS: usize = 128;

pub use error::QueueError;
pub use faa::{
    Emptiness, FaaArrayQueue, FaaQueue, FaaQueueV1, FaaQueueV2, FaaQueueV3, Original, Variant1,
    Variant2, Variant3,
};
pub use hazard::HazardPointers;
pub use lcrq::Lcrq;
pub use msq::MsQueue;
pub use scq::{Lscq2, Lscqd};
