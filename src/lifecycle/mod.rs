//! Lifecycle management.
//!
//! # Data Flow
//! ```text
//! Serve:
//!     Start worker pool → spawn accept loops → collect loop results
//!
//! Shutdown (shutdown.rs):
//!     trigger() → flag latched, deadline recorded → accept loops woken
//!     → stop accepting → drain within deadline (if any) → serve returns
//! ```

pub mod shutdown;

pub use shutdown::ShutdownSignal;
