use thiserror::Error;

/// Error types for queue construction.
///
/// Queue operations themselves are infallible: `dequeue` returning `None`
/// is the ordinary empty signal and enqueue of a null element is ruled out
/// by the `NonNull` element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Requested thread capacity is zero or exceeds the compiled-in limit.
    #[error("requested {requested} threads, limit is {limit}")]
    MaxThreadsExceeded {
        /// The thread count passed to the constructor.
        requested: usize,
        /// The compiled-in `MAX_THREADS` limit.
        limit: usize,
    },
}
