//! Engine lifecycle: start, background tasks, shutdown.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::CacheManager;
use crate::storage::chunked::{ChunkedBackend, DirArea, KvArea, MemoryArea};
use crate::storage::memory::InMemoryBackend;
use crate::storage::sql::SqlBackend;
use crate::storage::traits::{CacheBackend, StorageError};
use crate::sync::{SyncCoordinator, SyncQueue};

use super::{EngineState, FlightSyncEngine, Runtime};

impl FlightSyncEngine {
    /// Open local storage from the configuration and start background work.
    ///
    /// Startup flow:
    /// 1. Open the sync queue (durable when `queue_path` is set)
    /// 2. Open tiers: indexed (SQLite), quota-limited, volatile
    /// 3. Spawn cache maintenance and the reconnect watcher
    ///
    /// A tier that fails to open is skipped with a warning; the queue is
    /// required.
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> Result<(), StorageError> {
        if self.runtime.is_some() && self.is_running() {
            warn!("Engine already running, start ignored");
            return Ok(());
        }
        self.set_state(EngineState::Connecting);

        let queue = match &self.config.queue_path {
            Some(path) => SyncQueue::open(path).await,
            None => SyncQueue::in_memory().await,
        };
        let queue = match queue {
            Ok(queue) => Arc::new(queue),
            Err(e) => {
                self.set_state(EngineState::Created);
                return Err(e);
            }
        };

        let tiers = self.open_tiers().await;
        self.start_with(tiers, queue);
        Ok(())
    }

    /// Start with caller-provided tiers and queue.
    pub fn start_with(&mut self, tiers: Vec<Arc<dyn CacheBackend>>, queue: Arc<SyncQueue>) {
        if self.runtime.is_some() && self.is_running() {
            warn!("Engine already running, start ignored");
            return;
        }
        self.set_state(EngineState::Connecting);

        let cache = Arc::new(CacheManager::new(tiers, self.config.cache_ttl()));
        let coordinator = Arc::new(SyncCoordinator::from_config(
            queue,
            Arc::clone(&self.remote),
            &self.config,
        ));
        let runtime = Runtime {
            cache,
            coordinator,
            handler: Arc::clone(&self.handler),
            users: Arc::clone(&self.users),
            local_writes: Arc::new(tokio::sync::Mutex::new(())),
        };

        self.shutdown_tx.send_replace(false);
        let maintenance = self.spawn_maintenance(&runtime);
        let watcher = self.spawn_reconnect_watcher(&runtime);
        self.tasks.lock().extend([maintenance, watcher]);

        info!(
            tiers = ?runtime.cache.tiers().iter().map(|t| t.kind()).collect::<Vec<_>>(),
            "Flight sync engine running"
        );
        self.runtime = Some(runtime);
        self.set_state(EngineState::Running);
    }

    async fn open_tiers(&self) -> Vec<Arc<dyn CacheBackend>> {
        let mut tiers: Vec<Arc<dyn CacheBackend>> = Vec::new();

        let indexed = match &self.config.sqlite_path {
            Some(path) => SqlBackend::open(path).await,
            None => SqlBackend::in_memory().await,
        };
        match indexed {
            Ok(backend) => tiers.push(Arc::new(backend)),
            Err(e) => warn!(error = %e, "Indexed tier unavailable, continuing without it"),
        }

        let area: Option<Arc<dyn KvArea>> = match &self.config.quota_dir {
            Some(dir) => match DirArea::open(dir, self.config.quota_bytes).await {
                Ok(area) => Some(Arc::new(area) as Arc<dyn KvArea>),
                Err(e) => {
                    warn!(dir = %dir, error = %e, "Quota tier unavailable, continuing without it");
                    None
                }
            },
            None => Some(Arc::new(MemoryArea::new(self.config.quota_bytes)) as Arc<dyn KvArea>),
        };
        if let Some(area) = area {
            tiers.push(Arc::new(ChunkedBackend::new(
                area,
                self.config.chunk_size,
                self.config.fallback_chunk_size,
            )));
        }

        tiers.push(Arc::new(InMemoryBackend::new()));
        tiers
    }

    fn spawn_maintenance(&self, runtime: &Runtime) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(&runtime.cache);
        let users = Arc::clone(&runtime.users);
        let interval = self.config.maintenance_interval();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            cache.run_maintenance(users, interval, shutdown).await;
        })
    }

    /// Replay every active user's queue on each offline → online edge.
    fn spawn_reconnect_watcher(&self, runtime: &Runtime) -> tokio::task::JoinHandle<()> {
        let runtime = runtime.clone();
        let connectivity = Arc::clone(&self.connectivity);
        let mut online_rx = connectivity.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        // Counted edges survive the watch channel coalescing a quick
        // offline/online flip into a single notification.
        let mut seen_reconnects = connectivity.stats().reconnects;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let online = *online_rx.borrow_and_update();
                        let reconnects = connectivity.stats().reconnects;
                        if online && reconnects > seen_reconnects {
                            seen_reconnects = reconnects;
                            let users: Vec<String> = runtime.users.iter().map(|u| u.key().clone()).collect();
                            info!(users = users.len(), "Back online, replaying queued changes");
                            for user_id in users {
                                let report = runtime.reconcile(&user_id).await;
                                if !report.success {
                                    warn!(
                                        user_id = %user_id,
                                        errors = report.errors.len(),
                                        conflicts = report.conflicts.len(),
                                        "Reconnect sync incomplete"
                                    );
                                }
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Stop background tasks and drop remote subscriptions. Local data and
    /// the queue are left intact.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::Stopped | EngineState::Created) {
            return;
        }
        self.set_state(EngineState::ShuttingDown);
        self.shutdown_tx.send_replace(true);

        self.subscriptions.lock().clear();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.set_state(EngineState::Stopped);
        info!("Flight sync engine stopped");
    }
}
