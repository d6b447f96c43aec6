//! # Flight Sync
//!
//! An offline-first sync and multi-tier cache engine for per-user flight
//! records.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     FlightSyncEngine                        │
//! │  • load / update / import / sync / logout                  │
//! │  • Replays queued changes on offline → online edges        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!            ┌─────────────────┴─────────────────┐
//!            ▼                                   ▼
//! ┌──────────────────────────┐     ┌──────────────────────────────┐
//! │      CacheManager        │     │       SyncCoordinator        │
//! │  • Indexed (SQLite)      │     │  • Durable FIFO SyncQueue    │
//! │  • Quota-limited chunks  │     │  • Conflict detection        │
//! │  • Volatile memory       │     │  • One pass per user at once │
//! │  • TTL, schema, eviction │     │                              │
//! └──────────────────────────┘     └──────────────────────────────┘
//!                                                │
//!                                                ▼
//!                               ┌──────────────────────────────┐
//!                               │   RecordStore (remote)       │
//!                               │  • get / put / delete        │
//!                               │  • change subscriptions      │
//!                               └──────────────────────────────┘
//! ```
//!
//! Reads never wait on the network when a valid local copy exists. Writes
//! land in the cache and the queue first; the next sync replays them in
//! order, detecting conflicts against the version each change was made on.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flight_sync::{FlightRecord, FlightStatus, FlightSyncConfig, FlightSyncEngine, InMemoryRecordStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let remote = Arc::new(InMemoryRecordStore::new());
//!     let mut engine = FlightSyncEngine::new(FlightSyncConfig::default(), remote);
//!     engine.start().await.expect("Failed to start");
//!
//!     let records = engine.load_records("crew-0042").await.unwrap();
//!     if let Some(first) = records.first() {
//!         engine
//!             .update_status("crew-0042", &first.id, FlightStatus { departed: true, landed: false })
//!             .await
//!             .unwrap();
//!     }
//!
//!     let report = engine.sync_now("crew-0042").await.unwrap();
//!     println!("synced {} changes", report.synced_count);
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: the [`FlightSyncEngine`] facade
//! - [`cache`]: tier selection, TTL, schema checks and maintenance
//! - [`storage`]: local tiers (SQLite, chunked quota area, memory)
//! - [`sync`]: queue, remote store seam, conflicts and the coordinator
//! - [`merge`]: schedule import merging by period
//! - [`network`]: connectivity tracking
//! - [`resilience`]: retry policies

pub mod cache;
pub mod compression;
pub mod config;
pub mod engine;
pub mod merge;
pub mod metrics;
pub mod network;
pub mod record;
pub mod resilience;
pub mod storage;
pub mod sync;

pub use cache::{CacheManager, CacheReport, TierStatus};
pub use config::FlightSyncConfig;
pub use engine::{EngineError, EngineState, FlightSyncEngine, HealthCheck};
pub use merge::{MergeEngine, MergeError, MergeOptions, MergeOutcome, MergeSummary};
pub use network::Connectivity;
pub use record::{FlightRecord, FlightStatus, Period, StoragePath};
pub use resilience::retry::RetryConfig;
pub use storage::traits::{CacheBackend, StorageError, TierKind};
pub use sync::{
    Choice, ConflictHandler, ConflictInfo, ConflictResolver, InMemoryRecordStore, PendingOp, RecordStore,
    RemoteError, SyncCoordinator, SyncError, SyncQueue, SyncReport, SyncStatus,
};
pub use metrics::LatencyTimer;
