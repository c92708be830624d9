//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured `tracing` events)
//!     → metrics.rs (counters and gauges through the `metrics` facade)
//!
//! Consumers:
//!     → stderr (pretty or JSON lines)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Log fields are structured, never formatted into the message
//! - Metrics are cheap when no exporter is installed

pub mod logging;
pub mod metrics;
