//! Table registry and query execution.
//!
//! # Data Flow
//! ```text
//! register(provider) ──▶ tables: name → Entry { schema, provider, interest, buffer }
//!
//! control loop tick:
//!     poll()   ──▶ every interested event table ──▶ provider.poll()
//!                  ──▶ schema check ──▶ buffer (seq, observed_at, row)
//!     expire() ──▶ drop buffered rows older than now - retention
//!
//! execute(query) ──▶ resolve columns ──▶ snapshot(predicates) | buffer
//!                ──▶ re-filter ──▶ project ──▶ limit
//! ```
//!
//! # Design Decisions
//! - Pushed-down predicates are hints; every row is filtered again here
//! - A failing provider contributes zero rows for that cycle and is logged
//! - Event tables are only polled while somebody holds an interest; the
//!   last release deactivates the provider and drops its buffer

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::database::query::{Query, QueryError};
use crate::database::table::{Schema, TableMode, TableProvider};
use crate::database::value::Row;
use crate::observability::metrics;

/// Errors raised while composing the registry at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("table '{0}' is already registered")]
    Duplicate(String),

    #[error("table '{table}' has an invalid schema: {reason}")]
    InvalidSchema { table: String, reason: String },
}

/// Limits applied to event table buffers.
#[derive(Debug, Clone, Copy)]
pub struct DatabaseOptions {
    /// Buffered rows older than this are dropped by `expire`.
    pub retention: Duration,
    /// Upper bound on buffered rows per event table; oldest rows go first.
    pub max_buffered_rows: usize,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(300),
            max_buffered_rows: 10_000,
        }
    }
}

/// Result of a query: projected column names and matching rows.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

struct BufferedRow {
    seq: u64,
    observed_at: SystemTime,
    row: Row,
}

#[derive(Default)]
struct EventBuffer {
    rows: VecDeque<BufferedRow>,
    next_seq: u64,
    active: bool,
}

struct Entry {
    schema: Schema,
    provider: TableProvider,
    interest: usize,
    buffer: EventBuffer,
}

impl Entry {
    /// Activate an event provider if it is not already active.
    fn ensure_active(&mut self) {
        if self.buffer.active {
            return;
        }
        if let TableProvider::Event(table) = &mut self.provider {
            match table.activate() {
                Ok(()) => {
                    self.buffer.active = true;
                    tracing::debug!(table = %self.schema.name, "Event table activated");
                }
                Err(e) => {
                    metrics::record_provider_error(&self.schema.name);
                    tracing::warn!(table = %self.schema.name, error = %e, "Failed to activate event table");
                }
            }
        }
    }

    fn deactivate(&mut self) {
        if let TableProvider::Event(table) = &mut self.provider {
            if self.buffer.active {
                table.deactivate();
                tracing::debug!(table = %self.schema.name, "Event table deactivated");
            }
        }
        self.buffer.active = false;
        self.buffer.rows.clear();
        metrics::record_buffered_rows(&self.schema.name, 0);
    }
}

/// Registry of live tables plus the query engine over them.
pub struct Database {
    tables: BTreeMap<String, Entry>,
    options: DatabaseOptions,
}

impl Database {
    /// Create an empty database.
    pub fn new(options: DatabaseOptions) -> Self {
        Self {
            tables: BTreeMap::new(),
            options,
        }
    }

    /// Register a provider under its schema name.
    pub fn register(&mut self, provider: TableProvider) -> Result<(), RegistrationError> {
        let schema = provider.schema();
        validate_schema(&schema)?;
        if self.tables.contains_key(&schema.name) {
            return Err(RegistrationError::Duplicate(schema.name));
        }

        tracing::debug!(
            table = %schema.name,
            mode = ?provider.mode(),
            columns = schema.columns.len(),
            "Table registered"
        );
        self.tables.insert(
            schema.name.clone(),
            Entry {
                schema,
                provider,
                interest: 0,
                buffer: EventBuffer::default(),
            },
        );
        Ok(())
    }

    /// Names of every registered table, sorted.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn schema(&self, table: &str) -> Option<&Schema> {
        self.tables.get(table).map(|e| &e.schema)
    }

    pub fn mode(&self, table: &str) -> Option<TableMode> {
        self.tables.get(table).map(|e| e.provider.mode())
    }

    /// Number of live interests held on `table`.
    pub fn interest(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |e| e.interest)
    }

    /// Number of rows currently buffered for an event table.
    pub fn buffered_rows(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |e| e.buffer.rows.len())
    }

    /// Tables with at least one live interest.
    pub fn active_tables(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(_, e)| e.interest > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Register an interest in `table`. The first interest activates an
    /// event provider.
    pub fn acquire(&mut self, table: &str) -> Result<(), QueryError> {
        let entry = self
            .tables
            .get_mut(table)
            .ok_or_else(|| QueryError::UnknownTable(table.to_string()))?;

        entry.interest += 1;
        if entry.interest == 1 {
            entry.ensure_active();
        }
        Ok(())
    }

    /// Drop an interest in `table`. Releasing the last one deactivates the
    /// table and discards its buffered rows.
    pub fn release(&mut self, table: &str) {
        let entry = match self.tables.get_mut(table) {
            Some(entry) => entry,
            None => return,
        };
        if entry.interest == 0 {
            tracing::warn!(table = %table, "Release without a matching acquire");
            return;
        }

        entry.interest -= 1;
        if entry.interest == 0 {
            entry.deactivate();
        }
    }

    /// Collect new rows from every interested event table.
    pub fn poll(&mut self) {
        let max_rows = self.options.max_buffered_rows;

        for entry in self.tables.values_mut().filter(|e| e.interest > 0) {
            if entry.provider.mode() != TableMode::Event {
                continue;
            }
            // Activation failures are retried on every tick.
            entry.ensure_active();
            if !entry.buffer.active {
                continue;
            }

            let rows = match &mut entry.provider {
                TableProvider::Event(table) => table.poll(),
                TableProvider::Snapshot(_) => continue,
            };
            let rows = match checked_rows(&entry.schema, rows) {
                Some(rows) => rows,
                None => continue,
            };
            if rows.is_empty() {
                continue;
            }

            let observed_at = SystemTime::now();
            for row in rows {
                let seq = entry.buffer.next_seq;
                entry.buffer.next_seq += 1;
                entry.buffer.rows.push_back(BufferedRow { seq, observed_at, row });
            }
            while entry.buffer.rows.len() > max_rows {
                entry.buffer.rows.pop_front();
            }
            metrics::record_buffered_rows(&entry.schema.name, entry.buffer.rows.len());
        }
    }

    /// Discard buffered rows observed before `now - retention`.
    pub fn expire(&mut self, now: SystemTime) {
        let horizon = match now.checked_sub(self.options.retention) {
            Some(horizon) => horizon,
            None => return,
        };

        for entry in self.tables.values_mut().filter(|e| e.interest > 0) {
            let before = entry.buffer.rows.len();
            while entry
                .buffer
                .rows
                .front()
                .map_or(false, |r| r.observed_at < horizon)
            {
                entry.buffer.rows.pop_front();
            }
            if entry.buffer.rows.len() != before {
                metrics::record_buffered_rows(&entry.schema.name, entry.buffer.rows.len());
            }
        }
    }

    /// Run `query` and return every matching row.
    pub fn execute(&mut self, query: &Query) -> Result<QueryResult, QueryError> {
        self.execute_since(query, 0).map(|(result, _)| result)
    }

    /// Run `query`, returning only event rows with a sequence number of at
    /// least `from_seq`, plus the cursor to pass next time.
    ///
    /// Snapshot tables ignore the cursor and always return the full result.
    pub fn execute_since(&mut self, query: &Query, from_seq: u64) -> Result<(QueryResult, u64), QueryError> {
        let result = self.run(query, from_seq);
        metrics::record_query(match &result {
            Ok(_) => "ok",
            Err(QueryError::Syntax(_)) => "syntax",
            Err(QueryError::UnknownTable(_)) => "unknown_table",
            Err(QueryError::UnknownColumn { .. }) => "unknown_column",
            Err(QueryError::TypeMismatch { .. }) => "type_mismatch",
        });
        result
    }

    fn run(&mut self, query: &Query, from_seq: u64) -> Result<(QueryResult, u64), QueryError> {
        let entry = self
            .tables
            .get_mut(&query.table)
            .ok_or_else(|| QueryError::UnknownTable(query.table.clone()))?;
        let plan = Plan::resolve(&entry.schema, query)?;
        let limit = query.limit.unwrap_or(usize::MAX);

        match &mut entry.provider {
            TableProvider::Snapshot(table) => {
                let rows = checked_rows(&entry.schema, table.snapshot(&query.predicates)).unwrap_or_default();
                let rows = rows
                    .into_iter()
                    .filter(|row| query.admits(row, &plan.predicates))
                    .take(limit)
                    .map(|row| plan.project(row))
                    .collect();
                Ok((plan.result(rows), 0))
            }
            TableProvider::Event(_) => {
                let mut cursor = entry.buffer.next_seq.max(from_seq);
                let mut rows = Vec::new();
                for buffered in entry.buffer.rows.iter().filter(|r| r.seq >= from_seq) {
                    if !query.admits(&buffered.row, &plan.predicates) {
                        continue;
                    }
                    if rows.len() == limit {
                        // Resume from the first row that did not fit.
                        cursor = buffered.seq;
                        break;
                    }
                    rows.push(plan.project(buffered.row.clone()));
                }
                Ok((plan.result(rows), cursor))
            }
        }
    }
}

/// Column positions resolved for one query.
struct Plan {
    columns: Vec<String>,
    projection: Option<Vec<usize>>,
    predicates: Vec<usize>,
}

impl Plan {
    fn resolve(schema: &Schema, query: &Query) -> Result<Self, QueryError> {
        let position = |column: &str| -> Result<usize, QueryError> {
            schema.column_index(column).ok_or_else(|| QueryError::UnknownColumn {
                table: schema.name.clone(),
                column: column.to_string(),
            })
        };

        let (columns, projection) = if query.columns.is_empty() {
            (schema.column_names(), None)
        } else {
            let positions = query
                .columns
                .iter()
                .map(|c| position(c.as_str()))
                .collect::<Result<Vec<_>, _>>()?;
            (query.columns.clone(), Some(positions))
        };

        let mut predicates = Vec::with_capacity(query.predicates.len());
        for predicate in &query.predicates {
            let idx = position(predicate.column.as_str())?;
            let expected = schema.columns[idx].value_type;
            if !expected.accepts_literal(&predicate.value) {
                return Err(QueryError::TypeMismatch {
                    column: predicate.column.clone(),
                    expected,
                    literal: predicate.value.to_string(),
                });
            }
            predicates.push(idx);
        }

        Ok(Self {
            columns,
            projection,
            predicates,
        })
    }

    fn project(&self, row: Row) -> Row {
        match &self.projection {
            None => row,
            Some(positions) => positions.iter().map(|&i| row[i].clone()).collect(),
        }
    }

    fn result(&self, rows: Vec<Row>) -> QueryResult {
        QueryResult {
            columns: self.columns.clone(),
            rows,
        }
    }
}

fn validate_schema(schema: &Schema) -> Result<(), RegistrationError> {
    let invalid = |reason: &str| RegistrationError::InvalidSchema {
        table: schema.name.clone(),
        reason: reason.to_string(),
    };

    if schema.name.is_empty() {
        return Err(invalid("empty table name"));
    }
    if schema.columns.is_empty() {
        return Err(invalid("no columns"));
    }
    for (i, column) in schema.columns.iter().enumerate() {
        if schema.columns[..i].iter().any(|c| c.name == column.name) {
            return Err(invalid(&format!("duplicate column '{}'", column.name)));
        }
    }
    Ok(())
}

/// Unwrap provider output, rejecting the whole batch on error or on any
/// row that does not fit the schema.
fn checked_rows(schema: &Schema, rows: Result<Vec<Row>, crate::database::table::TableError>) -> Option<Vec<Row>> {
    match rows {
        Ok(rows) => {
            if let Some(bad) = rows.iter().find(|row| !schema.matches(row)) {
                metrics::record_provider_error(&schema.name);
                tracing::warn!(
                    table = %schema.name,
                    expected = schema.columns.len(),
                    actual = bad.len(),
                    "Provider returned rows that do not match the schema, discarding batch"
                );
                return None;
            }
            Some(rows)
        }
        Err(e) => {
            metrics::record_provider_error(&schema.name);
            tracing::warn!(table = %schema.name, error = %e, "Table provider failed");
            None
        }
    }
}
