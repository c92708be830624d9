//! Endpoint telemetry agent library.
//!
//! Live operating-system state exposed as queryable tables, served to
//! remote monitoring peers over reconnecting TLS sessions.

// Runtime core
pub mod lifecycle;
pub mod scheduler;

// Data
pub mod database;
pub mod tables;

// Peers
pub mod identity;
pub mod net;
pub mod protocol;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod observability;
pub mod resilience;

pub use config::schema::AgentConfig;
pub use database::Database;
pub use error::{AgentError, AgentResult};
pub use protocol::Protocol;
pub use scheduler::Scheduler;
