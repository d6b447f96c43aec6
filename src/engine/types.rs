//! Public types for the flight sync engine.

use thiserror::Error;

use crate::merge::MergeError;
use crate::storage::traits::{StorageError, TierKind};
use crate::sync::SyncError;

/// Engine lifecycle state.
///
/// Use [`super::FlightSyncEngine::state()`] to check the current state or
/// [`super::FlightSyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Opening local tiers and the sync queue
    Connecting,
    /// Serving reads and accepting changes
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// Background tasks stopped
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine is not running (state: {0})")]
    NotRunning(EngineState),
    #[error("Network is offline")]
    Offline,
    #[error("No async runtime on the calling thread")]
    NoRuntime,
    #[error("Record '{0}' not found")]
    RecordNotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// Snapshot of engine health, cheap to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub state: EngineState,
    pub online: bool,
    /// Users with records loaded this session
    pub active_users: usize,
    /// Queue entries waiting across all users
    pub pending_entries: usize,
    /// Configured local tiers, in preference order
    pub tiers: Vec<TierKind>,
    /// Running and able to reach the local queue
    pub healthy: bool,
}
