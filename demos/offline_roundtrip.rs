//! Offline round trip: load, edit while offline, reconnect, replay.
//!
//! ```bash
//! RUST_LOG=flight_sync=debug cargo run --example offline_roundtrip
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use flight_sync::{
    FlightRecord, FlightStatus, FlightSyncConfig, FlightSyncEngine, InMemoryRecordStore, MergeOptions, RecordStore,
};
use tracing_subscriber::EnvFilter;

const USER: &str = "crew-0042";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let remote = InMemoryRecordStore::new();
    let mut engine = FlightSyncEngine::new(FlightSyncConfig::default(), Arc::new(remote.clone()));
    engine.start().await?;

    // 1. Import a roster for November
    let roster: Vec<_> = (3..=7)
        .map(|d| {
            FlightRecord::new("", format!("KE70{d}"), NaiveDate::from_ymd_opt(2025, 11, d).unwrap_or_default())
                .with_route("ICN-NRT")
                .with_times("09:10", "11:35")
        })
        .collect();
    let outcome = engine
        .import_schedule(USER, &roster, MergeOptions { remove_missing: true })
        .await?;
    println!("imported: {:?}", outcome.summary);
    engine.sync_now(USER).await?;

    // 2. Go offline and mark the first flight as flown
    engine.set_online(false);
    let first = engine.load_records(USER).await?[0].id.clone();
    engine
        .update_status(USER, &first, FlightStatus { departed: true, landed: true })
        .await?;
    println!("pending while offline: {}", engine.sync_status(USER).await?.pending_count);

    // 3. Reconnect; the queued change replays in the background
    engine.set_online(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("pending after reconnect: {}", engine.sync_status(USER).await?.pending_count);

    let stored = remote.get(USER).await?;
    let landed = stored.iter().filter(|r| r.status.landed).count();
    println!("remote has {} records, {} landed", stored.len(), landed);

    println!("{}", engine.cache_status(USER).await?);
    engine.shutdown().await;
    Ok(())
}
