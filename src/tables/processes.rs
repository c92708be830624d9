//! `processes`: one row per running process.

use std::time::{Duration, UNIX_EPOCH};

use sysinfo::{Pid, Process, ProcessesToUpdate, System};

use crate::database::{Predicate, Row, Schema, SnapshotTable, TableError, Value, ValueType};

/// Snapshot table over the process list.
pub struct ProcessesTable {
    system: System,
}

impl ProcessesTable {
    pub fn new() -> Self {
        Self { system: System::new() }
    }
}

impl Default for ProcessesTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotTable for ProcessesTable {
    fn schema(&self) -> Schema {
        Schema::new("processes", "current processes")
            .column("name", ValueType::Text, "name of process")
            .column("pid", ValueType::Integer, "process ID")
            .column("ppid", ValueType::Integer, "parent's process ID")
            .column("status", ValueType::Text, "scheduler state of the process")
            .column("started", ValueType::Time, "time process started")
            .column("vsize", ValueType::Count, "virtual size of process, in bytes")
            .column("rsize", ValueType::Count, "resident memory size of process, in bytes")
            .column("cpu", ValueType::Double, "CPU usage since the previous snapshot, in percent")
    }

    fn snapshot(&mut self, predicates: &[Predicate]) -> Result<Vec<Row>, TableError> {
        if let Some(pid) = pushed_down_pid(predicates) {
            self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            return Ok(self.system.process(pid).map(process_row).into_iter().collect());
        }

        self.system.refresh_processes(ProcessesToUpdate::All, true);
        let mut rows: Vec<(u32, Row)> = self
            .system
            .processes()
            .iter()
            .map(|(pid, process)| (pid.as_u32(), process_row(process)))
            .collect();
        rows.sort_by_key(|(pid, _)| *pid);
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }
}

/// PID of a `pid = N` predicate, if any.
fn pushed_down_pid(predicates: &[Predicate]) -> Option<Pid> {
    predicates
        .iter()
        .filter_map(|p| p.equality_on("pid"))
        .find_map(|value| match value {
            Value::Integer(n) => u32::try_from(*n).ok(),
            Value::Count(n) => u32::try_from(*n).ok(),
            _ => None,
        })
        .map(Pid::from_u32)
}

fn process_row(process: &Process) -> Row {
    vec![
        Value::Text(process.name().to_string_lossy().into_owned()),
        Value::Integer(i64::from(process.pid().as_u32())),
        process
            .parent()
            .map(|ppid| Value::Integer(i64::from(ppid.as_u32())))
            .unwrap_or(Value::Null),
        Value::Text(process.status().to_string()),
        Value::Time(UNIX_EPOCH + Duration::from_secs(process.start_time())),
        Value::Count(process.virtual_memory()),
        Value::Count(process.memory()),
        Value::Double(f64::from(process.cpu_usage())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Operator;

    #[test]
    fn pid_pushdown_detection() {
        let predicates = vec![
            Predicate::new("name", Operator::Equal, Value::Text("x".into())),
            Predicate::new("pid", Operator::Equal, Value::Integer(42)),
        ];
        assert_eq!(pushed_down_pid(&predicates), Some(Pid::from_u32(42)));

        let ranged = vec![Predicate::new("pid", Operator::Greater, Value::Integer(42))];
        assert_eq!(pushed_down_pid(&ranged), None);
        let negative = vec![Predicate::new("pid", Operator::Equal, Value::Integer(-1))];
        assert_eq!(pushed_down_pid(&negative), None);
    }

    #[test]
    fn rows_match_schema() {
        let mut table = ProcessesTable::new();
        let schema = table.schema();
        let rows = table.snapshot(&[]).unwrap();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|row| schema.matches(row)));
    }
}
