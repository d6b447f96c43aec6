//! Multi-tier local cache.

pub mod manager;

pub use manager::{format_bytes, CacheManager, CacheReport, MaintenanceReport, TierStatus};
