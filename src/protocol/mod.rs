//! Remote peer protocol.
//!
//! # Data Flow
//! ```text
//! Protocol::poll (loop thread)
//!     → Session::advance: transport events, timeouts, hello re-sends
//!     → Session::run_one: pending queries, due subscriptions (budgeted)
//!     → Database::execute_since
//!     → Transport::send → tokio task → socket
//!
//! Session states:
//!     Disconnected → Connecting → Handshaking → Established
//!          ▲______________|____________|____________|   (error, close, timeout)
//! ```
//!
//! # Design Decisions
//! - Sessions are plain state machines; all socket work lives in `net::connection`
//! - The peer timeout measures silence from the peer, our own sends do not count
//! - Teardown releases every table interest the session held

pub mod client;
pub mod message;
pub mod session;

pub use client::{Protocol, SessionStatus};
pub use message::{Hello, Message, QueryRequest};
pub use session::{SessionSettings, SessionState};
