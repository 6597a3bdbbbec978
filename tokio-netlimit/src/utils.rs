//! Helpers for measuring throttled streams.
pub mod rate_counter;
