//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Session (control loop thread)
//!     → connection.rs: Transport::spawn on the tokio runtime
//!     → TCP connect → tls.rs connector (optional TLS handshake)
//!     → newline-delimited frames in both directions
//!     → TransportEvent queue + scheduler wake
//! ```
//!
//! # Design Decisions
//! - Sockets never touch the control loop; it only sees queued events
//! - TLS without a CA or certificate encrypts but does not verify the peer
//! - Dropping a transport aborts its task and closes the socket

pub mod connection;
pub mod tls;
