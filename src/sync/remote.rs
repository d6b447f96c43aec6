//! Remote record store contract.
//!
//! The remote side is a per-user document collection laid out as
//! `users/{uid}/flights/{YYYY}/{MM}/{key}`. Writes are keyed upserts and
//! deletes, so replaying the same operation twice leaves the same state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::record::{FlightRecord, StoragePath};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),
    #[error("Remote store rejected the request: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Worth retrying: the request may succeed once the network recovers.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Called with the user's full remote snapshot after every change.
pub type ChangeCallback = Arc<dyn Fn(&[FlightRecord]) + Send + Sync>;

/// Handle for a live change subscription. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel.
    #[must_use]
    pub fn inert() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Authoritative per-user record collection.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Full snapshot of the user's records.
    async fn get(&self, user_id: &str) -> Result<Vec<FlightRecord>, RemoteError>;

    /// Keyed upsert at `path`.
    async fn put(&self, user_id: &str, record: &FlightRecord, path: &StoragePath) -> Result<(), RemoteError>;

    /// Keyed delete. Deleting a missing record is not an error.
    async fn delete(&self, user_id: &str, record_id: &str, path: &StoragePath) -> Result<(), RemoteError>;

    fn subscribe(&self, user_id: &str, on_change: ChangeCallback) -> Subscription;
}

struct Subscriber {
    user_id: String,
    callback: ChangeCallback,
}

#[derive(Default)]
struct Shared {
    docs: DashMap<String, FlightRecord>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
    writes: AtomicU64,
    offline: AtomicBool,
}

/// Process-local [`RecordStore`] for tests and local development.
///
/// Can be switched offline to simulate an unreachable backend.
#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    shared: Arc<Shared>,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::Release);
    }

    /// Successful puts and deletes since creation.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.shared.writes.load(Ordering::Relaxed)
    }

    /// Number of stored documents across all users.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.shared.docs.len()
    }

    /// Record by id, bypassing the network simulation.
    #[must_use]
    pub fn peek(&self, user_id: &str, record_id: &str) -> Option<FlightRecord> {
        let prefix = user_prefix(user_id);
        self.shared
            .docs
            .iter()
            .find(|e| e.key().starts_with(&prefix) && e.value().id == record_id)
            .map(|e| e.value().clone())
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.shared.offline.load(Ordering::Acquire) {
            return Err(RemoteError::Unavailable("in-memory store is offline".into()));
        }
        Ok(())
    }

    fn snapshot(&self, user_id: &str) -> Vec<FlightRecord> {
        let prefix = user_prefix(user_id);
        let mut records: Vec<FlightRecord> = self
            .shared
            .docs
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        records
    }

    fn notify(&self, user_id: &str) {
        // Collect first so callbacks run without the lock held.
        let callbacks: Vec<ChangeCallback> = self
            .shared
            .subscribers
            .lock()
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| Arc::clone(&s.callback))
            .collect();
        if callbacks.is_empty() {
            return;
        }
        let snapshot = self.snapshot(user_id);
        for callback in callbacks {
            callback(&snapshot);
        }
    }
}

fn user_prefix(user_id: &str) -> String {
    format!("users/{}/flights/", user_id)
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, user_id: &str) -> Result<Vec<FlightRecord>, RemoteError> {
        self.check_online()?;
        Ok(self.snapshot(user_id))
    }

    async fn put(&self, user_id: &str, record: &FlightRecord, path: &StoragePath) -> Result<(), RemoteError> {
        self.check_online()?;
        if record.id.is_empty() {
            return Err(RemoteError::Rejected("record id is empty".into()));
        }

        // A record whose date moved lives under a new path; drop the old document.
        let prefix = user_prefix(user_id);
        let location = path.location(user_id);
        self.shared
            .docs
            .retain(|k, v| !(k.starts_with(&prefix) && v.id == record.id && *k != location));

        let mut stored = record.clone();
        stored.storage_path = Some(path.clone());
        self.shared.docs.insert(location.clone(), stored);
        self.shared.writes.fetch_add(1, Ordering::Relaxed);
        debug!(user_id = %user_id, location = %location, version = record.version, "Remote put");

        self.notify(user_id);
        Ok(())
    }

    async fn delete(&self, user_id: &str, record_id: &str, path: &StoragePath) -> Result<(), RemoteError> {
        self.check_online()?;
        let prefix = user_prefix(user_id);
        let location = path.location(user_id);
        self.shared
            .docs
            .retain(|k, v| !(k.starts_with(&prefix) && (*k == location || v.id == record_id)));
        self.shared.writes.fetch_add(1, Ordering::Relaxed);
        debug!(user_id = %user_id, location = %location, "Remote delete");

        self.notify(user_id);
        Ok(())
    }

    fn subscribe(&self, user_id: &str, on_change: ChangeCallback) -> Subscription {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.shared.subscribers.lock().insert(
            id,
            Subscriber {
                user_id: user_id.to_string(),
                callback: on_change,
            },
        );

        let shared = Arc::downgrade(&self.shared);
        Subscription::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.subscribers.lock().remove(&id);
            }
        })
    }
}
