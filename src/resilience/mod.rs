//! Resilience helpers.
//!
//! Workers dial the edge with exponential backoff and jitter (backoff.rs).

pub mod backoff;
