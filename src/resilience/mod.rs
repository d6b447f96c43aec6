//! Resilience helpers for transient failures.

pub mod retry;
