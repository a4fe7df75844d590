//! Resumable chunked transfer engine.
//!
//! A transfer moves through `initialized -> checking -> uploading ->
//! merging -> completed`. Chunks arrive in any order on a worker pool, are
//! verified and recorded in a durable ledger, and the last one triggers a
//! single finalize guarded by a leased per-task lock.

pub mod engine;
pub mod error;
pub mod lock;
pub mod merge;
pub mod metrics;
pub mod notify;
pub mod pool;
pub mod tracker;

pub use engine::{CheckOutcome, ChunkOutcome, InitRequest, TransferEngine};
pub use error::{TransferError, TransferResult};
pub use lock::{LockGuard, MergeLock};
pub use merge::{MergeCoordinator, MergeOutcome};
pub use notify::{
    BroadcastSink, NoopSink, Notification, NotificationSink, Notifier, NotifyError, TracingSink,
    TransferEvent,
};
pub use pool::WorkerPool;
pub use tracker::{ChunkProgressTracker, ProgressSnapshot, RecordOutcome};
