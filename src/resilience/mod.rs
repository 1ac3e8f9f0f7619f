//! Resilience helpers for the accept engine.

pub mod backoff;

pub use backoff::AcceptBackoff;
