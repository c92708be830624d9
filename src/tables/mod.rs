//! Built-in tables.
//!
//! # Responsibilities
//! - `processes`: snapshot of the process list, with `pid = N` pushdown
//! - `sockets`: snapshot of open TCP/UDP sockets and their owners
//! - `system_logs`: events tailed from the system log file
//!
//! # Design Decisions
//! - Tables only read the host; nothing here keeps cross-poll state except
//!   the log tail offset
//! - A missing data source surfaces as `TableError::Unavailable` on activation

pub mod processes;
pub mod sockets;
pub mod system_logs;

use crate::config::TablesConfig;
use crate::database::TableProvider;

pub use processes::ProcessesTable;
pub use sockets::SocketsTable;
pub use system_logs::SystemLogsTable;

/// Every built-in table, configured from `[tables]`.
pub fn builtin(config: &TablesConfig) -> Vec<TableProvider> {
    vec![
        TableProvider::Snapshot(Box::new(ProcessesTable::new())),
        TableProvider::Snapshot(Box::new(SocketsTable::new())),
        TableProvider::Event(Box::new(SystemLogsTable::new(
            &config.system_log_path,
            config.max_rows_per_poll,
        ))),
    ]
}
