//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Peer session disconnects:
//!     → backoff.rs (reconnect interval + jitter)
//!     → session waits in Disconnected until the deadline
//!     → Connecting again
//! ```
//!
//! # Design Decisions
//! - Reconnects use a fixed interval, the jitter only spreads them out
//! - Deadlines are evaluated by polling on the control loop, never by sleeping

pub mod backoff;

pub use backoff::reconnect_delay;
