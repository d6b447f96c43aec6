//! Local storage tiers.
//!
//! - [`sql::SqlBackend`]: high-capacity indexed tier (SQLite)
//! - [`chunked::ChunkedBackend`]: quota-limited tier, chunked and compressed
//! - [`memory::InMemoryBackend`]: volatile tier

pub mod traits;
pub mod memory;
pub mod chunked;
pub mod sql;
