//! Live table database.
//!
//! # Responsibilities
//! - Hold the registered table providers and their immutable schemas
//! - Parse and execute filtering queries against them
//! - Buffer, poll and expire event tables while they are in use
//!
//! # Data Flow
//! ```text
//! console / peer session ──▶ Query::parse ──▶ Database::execute
//!                                              ├─▶ SnapshotTable::snapshot
//!                                              └─▶ event buffer ◀── EventTable::poll
//! ```

pub mod engine;
pub mod query;
pub mod table;
pub mod value;

pub use engine::{Database, DatabaseOptions, QueryResult, RegistrationError};
pub use query::{Operator, Predicate, Query, QueryError};
pub use table::{Column, EventTable, Schema, SnapshotTable, TableError, TableMode, TableProvider};
pub use value::{Row, Value, ValueType};
