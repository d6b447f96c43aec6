//! Offline write queue, conflict handling and replay to the remote store.

pub mod conflict;
pub mod queue;
pub mod remote;
pub mod strategy;

pub use conflict::{
    ChangeClass, Choice, ChoiceResolution, ConflictHandler, ConflictInfo, ConflictResolver, DefaultResolution,
    ResolvedRecord,
};
pub use queue::{PendingOp, QueueOperation, QueueStats, SyncQueue, SyncQueueEntry};
pub use remote::{ChangeCallback, InMemoryRecordStore, RecordStore, RemoteError, Subscription};
pub use strategy::{SyncCoordinator, SyncError, SyncReport, SyncStatus};
