//! Harbor sync
//!
//! Offline mutation handling:
//! - Durable FIFO queue of mutations that could not reach the network
//! - Replay passes that remove an entry only once the network confirms it
//! - Retry policy with exponential backoff and dead letters
//! - Connectivity monitoring that starts a pass when the network returns

pub mod connectivity;
pub mod processor;
pub mod queue;
pub mod retry;

pub use connectivity::{ConnectivityMonitor, ConnectivityProbe, ConnectivityState, Transition};
pub use processor::{PassReport, SyncProcessor, DEFAULT_REPLAY_TIMEOUT};
pub use queue::{
    DeadLetter, MutationId, QueueStore, QueuedMutation, ReplayRecord, SqliteQueue, SyncQueue,
    IDEMPOTENCY_KEY_HEADER,
};
pub use retry::{FailureAction, RetryPolicy};
