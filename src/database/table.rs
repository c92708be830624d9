//! Table schemas and the provider contract.
//!
//! # Responsibilities
//! - Describe a table (name, ordered columns)
//! - Define the two provider shapes the engine understands
//!
//! # Design Decisions
//! - Schemas are captured once at registration and never change afterwards
//! - Providers report failures as `TableError`; the engine logs them and
//!   treats the cycle as empty
//! - Predicates handed to `snapshot` are hints, the engine re-filters

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::query::Predicate;
use crate::database::value::{Row, ValueType};

/// Errors a table provider can report.
#[derive(Debug, Error)]
pub enum TableError {
    /// Reading the underlying OS source failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The data source does not exist on this platform or host.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Any other provider-specific failure.
    #[error("{0}")]
    Provider(String),
}

/// A column in a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value_type: ValueType,
    pub summary: String,
}

/// Schema of a table: its name and ordered columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub summary: String,
    pub columns: Vec<Column>,
}

impl Schema {
    /// Start a schema with no columns.
    pub fn new(name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            summary: summary.into(),
            columns: Vec::new(),
        }
    }

    /// Append a column.
    pub fn column(mut self, name: impl Into<String>, value_type: ValueType, summary: impl Into<String>) -> Self {
        self.columns.push(Column {
            name: name.into(),
            value_type,
            summary: summary.into(),
        });
        self
    }

    /// Position of `name` in the row layout.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Check that `row` has this schema's arity and column types.
    pub fn matches(&self, row: &Row) -> bool {
        row.len() == self.columns.len()
            && row.iter().zip(&self.columns).all(|(value, column)| {
                value
                    .value_type()
                    .map_or(true, |t| t == column.value_type)
            })
    }
}

/// Table recomputed on demand for every query.
pub trait SnapshotTable {
    fn schema(&self) -> Schema;

    /// Compute the current rows. `predicates` may be used to skip work but
    /// ignoring them is always correct.
    fn snapshot(&mut self, predicates: &[Predicate]) -> Result<Vec<Row>, TableError>;
}

/// Table fed incrementally while somebody is interested in it.
pub trait EventTable {
    fn schema(&self) -> Schema;

    /// Acquire the resources needed to observe new events.
    fn activate(&mut self) -> Result<(), TableError>;

    /// Release everything acquired by `activate`.
    fn deactivate(&mut self);

    /// Return the events observed since the previous call.
    fn poll(&mut self) -> Result<Vec<Row>, TableError>;
}

/// How a table produces its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableMode {
    Snapshot,
    Event,
}

/// A provider handed to the registry.
pub enum TableProvider {
    Snapshot(Box<dyn SnapshotTable>),
    Event(Box<dyn EventTable>),
}

impl TableProvider {
    pub fn snapshot<T: SnapshotTable + 'static>(table: T) -> Self {
        TableProvider::Snapshot(Box::new(table))
    }

    pub fn event<T: EventTable + 'static>(table: T) -> Self {
        TableProvider::Event(Box::new(table))
    }

    pub fn schema(&self) -> Schema {
        match self {
            TableProvider::Snapshot(t) => t.schema(),
            TableProvider::Event(t) => t.schema(),
        }
    }

    pub fn mode(&self) -> TableMode {
        match self {
            TableProvider::Snapshot(_) => TableMode::Snapshot,
            TableProvider::Event(_) => TableMode::Event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::value::Value;

    fn schema() -> Schema {
        Schema::new("t", "test table")
            .column("id", ValueType::Integer, "identifier")
            .column("name", ValueType::Text, "label")
    }

    #[test]
    fn column_lookup() {
        let schema = schema();
        assert_eq!(schema.column_index("name"), Some(1));
        assert_eq!(schema.column_index("missing"), None);
        assert_eq!(schema.column_names(), vec!["id", "name"]);
    }

    #[test]
    fn row_matching() {
        let schema = schema();
        assert!(schema.matches(&vec![Value::Integer(1), Value::Text("a".into())]));
        assert!(schema.matches(&vec![Value::Null, Value::Null]));
        assert!(!schema.matches(&vec![Value::Integer(1)]));
        assert!(!schema.matches(&vec![Value::Text("1".into()), Value::Text("a".into())]));
    }
}
