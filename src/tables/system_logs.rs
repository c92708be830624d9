//! `system_logs`: lines appended to the system log while the table is in use.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::SystemTime;

use crate::database::{EventTable, Row, Schema, TableError, Value, ValueType};

/// Event table tailing a syslog-style text file.
pub struct SystemLogsTable {
    path: PathBuf,
    max_rows_per_poll: usize,
    reader: Option<BufReader<File>>,
    /// Offset just past the last complete line consumed.
    position: u64,
}

impl SystemLogsTable {
    pub fn new(path: impl Into<PathBuf>, max_rows_per_poll: usize) -> Self {
        Self {
            path: path.into(),
            max_rows_per_poll,
            reader: None,
            position: 0,
        }
    }

    fn open(&mut self, from_end: bool) -> Result<(), TableError> {
        let mut file = File::open(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TableError::Unavailable(format!("{} does not exist", self.path.display()))
            } else {
                TableError::Io(e)
            }
        })?;
        self.position = if from_end { file.seek(SeekFrom::End(0))? } else { 0 };
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    /// True when the path now names a different file than the open handle.
    #[cfg(unix)]
    fn rotated(&self, reader: &BufReader<File>) -> bool {
        use std::os::unix::fs::MetadataExt;

        match (std::fs::metadata(&self.path), reader.get_ref().metadata()) {
            (Ok(current), Ok(open)) => current.ino() != open.ino() || current.dev() != open.dev(),
            _ => false,
        }
    }

    #[cfg(not(unix))]
    fn rotated(&self, _reader: &BufReader<File>) -> bool {
        false
    }
}

impl EventTable for SystemLogsTable {
    fn schema(&self) -> Schema {
        Schema::new("system_logs", "entries appended to the system log")
            .column("time", ValueType::Time, "time the entry was read")
            .column("process", ValueType::Text, "process that logged the entry")
            .column("pid", ValueType::Integer, "ID of the logging process")
            .column("message", ValueType::Text, "log message")
    }

    fn activate(&mut self) -> Result<(), TableError> {
        self.open(true)?;
        tracing::debug!(path = %self.path.display(), offset = self.position, "Tailing system log");
        Ok(())
    }

    fn deactivate(&mut self) {
        self.reader = None;
        self.position = 0;
    }

    fn poll(&mut self) -> Result<Vec<Row>, TableError> {
        let rotated = match &self.reader {
            Some(reader) => self.rotated(reader),
            None => return Err(TableError::Provider("system log is not open".to_string())),
        };
        if rotated {
            tracing::info!(path = %self.path.display(), "System log rotated, reopening");
            self.open(false)?;
        }

        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(Vec::new()),
        };
        if reader.get_ref().metadata()?.len() < self.position {
            // Truncated in place.
            self.position = 0;
        }
        reader.seek(SeekFrom::Start(self.position))?;

        let now = SystemTime::now();
        let mut rows = Vec::new();
        let mut line = Vec::new();
        while rows.len() < self.max_rows_per_poll {
            line.clear();
            let n = reader.read_until(b'\n', &mut line)?;
            if n == 0 || line.last() != Some(&b'\n') {
                // Leave a partial line for the next poll.
                break;
            }
            self.position += n as u64;

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end();
            if !text.is_empty() {
                rows.push(parse_line(text, now));
            }
        }
        Ok(rows)
    }
}

/// Split a traditional syslog line (`Mon DD HH:MM:SS host proc[pid]: message`).
/// Lines in other formats become a bare message.
fn parse_line(line: &str, now: SystemTime) -> Row {
    let (process, pid, message) = split_syslog(line).unwrap_or((None, None, line));
    vec![
        Value::Time(now),
        Value::optional_text(process),
        pid.map(Value::Integer).unwrap_or(Value::Null),
        Value::Text(message.to_string()),
    ]
}

fn split_syslog(line: &str) -> Option<(Option<&str>, Option<i64>, &str)> {
    // Skip month, day, time and host; days below 10 are space padded.
    let mut rest = line;
    for _ in 0..4 {
        let trimmed = rest.trim_start_matches(' ');
        let end = trimmed.find(' ')?;
        rest = &trimmed[end..];
    }
    let rest = rest.trim_start_matches(' ');

    let (tag, message) = rest.split_once(": ")?;
    if tag.contains(' ') {
        return None;
    }
    match tag.split_once('[') {
        Some((process, pid)) => {
            let pid = pid.strip_suffix(']').and_then(|p| p.parse().ok());
            Some((Some(process), pid, message))
        }
        None => Some((Some(tag), None, message)),
    }
}
