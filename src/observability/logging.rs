//! Structured logging.
//!
//! # Responsibilities
//! - Install the global `tracing` subscriber once at startup
//! - Pick the log level from `RUST_LOG`, falling back to the configured level
//! - Render events either for humans or as JSON lines
//!
//! # Design Decisions
//! - Logs go to stderr so `--execute` output on stdout stays clean
//! - A second initialization (tests, embedding) is ignored rather than fatal

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::schema::{LogFormat, ObservabilityConfig};

/// Initialize the global subscriber from the observability section.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.log_format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Logging already initialized");
    }
}
