// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flight sync engine.
//!
//! The [`FlightSyncEngine`] ties the pieces together for an application:
//! - local tiers behind the [`CacheManager`]
//! - the durable [`SyncQueue`] and its [`SyncCoordinator`]
//! - [`Connectivity`], whose offline → online edge triggers replay
//! - schedule imports through the [`MergeEngine`](crate::merge::MergeEngine)
//!
//! Reads are always served locally. Writes land in the cache and the queue
//! first and reach the remote store on the next sync.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flight_sync::{FlightSyncConfig, FlightSyncEngine, EngineState, InMemoryRecordStore};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let remote = Arc::new(InMemoryRecordStore::new());
//! let mut engine = FlightSyncEngine::new(FlightSyncConfig::default(), remote);
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await.expect("start failed");
//! let records = engine.load_records("user-1").await.expect("load failed");
//! println!("{} records", records.len());
//! engine.shutdown().await;
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{EngineError, EngineState, HealthCheck};

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::CacheManager;
use crate::config::FlightSyncConfig;
use crate::network::Connectivity;
use crate::record::FlightRecord;
use crate::sync::{
    ConflictHandler, DefaultResolution, QueueOperation, RecordStore, Subscription, SyncCoordinator, SyncQueue,
    SyncQueueEntry, SyncReport,
};

/// Parts shared with background tasks once the engine runs.
#[derive(Clone)]
pub(super) struct Runtime {
    pub(super) cache: Arc<CacheManager>,
    pub(super) coordinator: Arc<SyncCoordinator>,
    pub(super) handler: Arc<dyn ConflictHandler>,
    pub(super) users: Arc<DashSet<String>>,
    /// Serializes read-modify-write cycles on the cached sets
    pub(super) local_writes: Arc<tokio::sync::Mutex<()>>,
}

impl Runtime {
    /// Replay the queue, then refresh the cache from the remote snapshot
    /// with still-pending changes laid over it.
    pub(super) async fn reconcile(&self, user_id: &str) -> SyncReport {
        let local = self.cache.load(user_id).await;
        let report = self
            .coordinator
            .sync(user_id, &local, Some(self.handler.as_ref()))
            .await;

        if report.remote_fetched {
            let _writes = self.local_writes.lock().await;
            match self.coordinator.queue().entries(user_id).await {
                Ok(pending) => {
                    let merged = overlay_pending(report.remote_records.clone(), &pending);
                    self.cache.store(user_id, &merged).await;
                }
                Err(e) => warn!(user_id = %user_id, error = %e, "Queue unreadable, cache not refreshed"),
            }
        }
        report
    }
}

/// Offline-first flight record engine.
///
/// # Thread Safety
///
/// Every operation takes `&self`; the engine can be shared behind an `Arc`
/// once started.
pub struct FlightSyncEngine {
    pub(super) config: FlightSyncConfig,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) remote: Arc<dyn RecordStore>,
    pub(super) connectivity: Arc<Connectivity>,
    pub(super) handler: Arc<dyn ConflictHandler>,

    /// Set by `start()`
    pub(super) runtime: Option<Runtime>,

    /// Users touched this session; maintenance and auto-sync cover them
    pub(super) users: Arc<DashSet<String>>,

    /// Live remote subscriptions per user
    pub(super) subscriptions: Mutex<HashMap<String, Subscription>>,

    pub(super) shutdown_tx: watch::Sender<bool>,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FlightSyncEngine {
    /// Create a new engine in `Created` state. Call
    /// [`start()`](Self::start) to open local storage.
    pub fn new(config: FlightSyncConfig, remote: Arc<dyn RecordStore>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            state: state_tx,
            state_rx,
            remote,
            connectivity: Arc::new(Connectivity::default()),
            handler: Arc::new(DefaultResolution),
            runtime: None,
            users: Arc::new(DashSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Use `handler` for conflicts found by sync passes instead of the
    /// default resolution. Set before `start()`.
    #[must_use]
    pub fn with_conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Share an existing connectivity tracker. Set before `start()`.
    #[must_use]
    pub fn with_connectivity(mut self, connectivity: Arc<Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    #[must_use]
    pub fn config(&self) -> &FlightSyncConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &Arc<Connectivity> {
        &self.connectivity
    }

    /// Report a network transition. Going online replays queued changes in
    /// the background.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
        debug!(state = %state, "Engine state changed");
    }

    pub(super) fn runtime(&self) -> Result<&Runtime, EngineError> {
        match (&self.runtime, self.state()) {
            (Some(runtime), EngineState::Running) => Ok(runtime),
            (_, state) => Err(EngineError::NotRunning(state)),
        }
    }

    /// Local cache, once started.
    pub fn cache(&self) -> Option<&Arc<CacheManager>> {
        self.runtime.as_ref().map(|r| &r.cache)
    }

    /// Sync coordinator, once started.
    pub fn coordinator(&self) -> Option<&Arc<SyncCoordinator>> {
        self.runtime.as_ref().map(|r| &r.coordinator)
    }

    /// Sync queue, once started.
    pub fn queue(&self) -> Option<&Arc<SyncQueue>> {
        self.coordinator().map(|c| c.queue())
    }
}

/// Apply pending queue entries, in order, on top of a remote snapshot.
pub(crate) fn overlay_pending(mut records: Vec<FlightRecord>, pending: &[SyncQueueEntry]) -> Vec<FlightRecord> {
    for entry in pending {
        let position = records.iter().position(|r| r.id == entry.record_id);
        match (entry.operation, position) {
            (QueueOperation::Delete, Some(i)) => {
                records.remove(i);
            }
            (QueueOperation::Delete, None) => {}
            (_, Some(i)) => records[i] = entry.payload.clone(),
            (_, None) => records.push(entry.payload.clone()),
        }
    }
    records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
    records
}
