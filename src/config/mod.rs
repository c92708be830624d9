//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → command line overrides (main.rs)
//!     → validation.rs (semantic checks)
//!     → AgentConfig (validated, immutable)
//!     → borrowed by startup to build every subsystem
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, read_config, ConfigError};
pub use schema::{AgentConfig, LogFormat, PeerConfig, TablesConfig, TlsSettings};
pub use validation::{parse_destination, validate_config, ValidationError};
