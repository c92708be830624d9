//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Block signals → Start runtime → Register tables → Connect peers → Loop
//!
//! Signals (signals.rs):
//!     SIGINT/SIGTERM → waiter thread → newest handler → Scheduler::terminate
//!
//! Shutdown (startup.rs):
//!     Loop exits → Close sessions → Stop runtime → Restore signal mask
//! ```
//!
//! # Design Decisions
//! - The signal mask is installed before any other thread is spawned
//! - Handlers are a per-signal LIFO stack; only the newest one runs
//! - Shutdown is ordered: sessions first, the gateway last

pub mod signals;
pub mod startup;

pub use signals::{SignalError, SignalGateway, SignalHandler};
pub use startup::run;
