//! `sockets`: open network sockets and their owning processes.
//!
//! Linux reads `/proc/net/{tcp,tcp6,udp,udp6}` and maps socket inodes to PIDs
//! by scanning `/proc/<pid>/fd`. Other platforms report no rows.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use crate::database::{Predicate, Row, Schema, SnapshotTable, TableError, Value, ValueType};

/// Snapshot table over the kernel's socket tables.
#[derive(Debug, Default)]
pub struct SocketsTable;

impl SocketsTable {
    pub fn new() -> Self {
        Self
    }
}

impl SnapshotTable for SocketsTable {
    fn schema(&self) -> Schema {
        Schema::new("sockets", "open network sockets")
            .column("pid", ValueType::Integer, "ID of process holding the socket")
            .column("process", ValueType::Text, "name of process holding the socket")
            .column("family", ValueType::Text, "IPv4 or IPv6")
            .column("protocol", ValueType::Text, "transport protocol")
            .column("local_addr", ValueType::Address, "local IP address")
            .column("local_port", ValueType::Integer, "local port number")
            .column("remote_addr", ValueType::Address, "remote IP address")
            .column("remote_port", ValueType::Integer, "remote port number")
            .column("state", ValueType::Text, "state of socket")
    }

    fn snapshot(&mut self, _predicates: &[Predicate]) -> Result<Vec<Row>, TableError> {
        if !cfg!(target_os = "linux") {
            return Ok(Vec::new());
        }

        let owners = socket_owners(Path::new("/proc"));
        let mut rows = Vec::new();
        for (file, family, protocol) in [
            ("tcp", "IPv4", "tcp"),
            ("tcp6", "IPv6", "tcp"),
            ("udp", "IPv4", "udp"),
            ("udp6", "IPv6", "udp"),
        ] {
            let path = Path::new("/proc/net").join(file);
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                // IPv6 may be disabled.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            for entry in contents.lines().skip(1).filter_map(parse_line) {
                let owner = owners.get(&entry.inode);
                rows.push(vec![
                    owner.map(|o| Value::Integer(o.pid)).unwrap_or(Value::Null),
                    Value::optional_text(owner.and_then(|o| o.name.clone())),
                    Value::Text(family.to_string()),
                    Value::Text(protocol.to_string()),
                    Value::Address(entry.local.0),
                    Value::Integer(i64::from(entry.local.1)),
                    Value::Address(entry.remote.0),
                    Value::Integer(i64::from(entry.remote.1)),
                    Value::Text(state_name(protocol, entry.state).to_string()),
                ]);
            }
        }
        Ok(rows)
    }
}

#[derive(Debug, PartialEq)]
struct SocketEntry {
    local: (IpAddr, u16),
    remote: (IpAddr, u16),
    state: u8,
    inode: u64,
}

struct Owner {
    pid: i64,
    name: Option<String>,
}

fn parse_line(line: &str) -> Option<SocketEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }

    Some(SocketEntry {
        local: parse_endpoint(fields[1])?,
        remote: parse_endpoint(fields[2])?,
        state: u8::from_str_radix(fields[3], 16).ok()?,
        inode: fields[9].parse().ok()?,
    })
}

/// Parse `ADDR:PORT` where the address is the kernel's native-endian hex
/// dump of the 4 or 16 address bytes.
fn parse_endpoint(field: &str) -> Option<(IpAddr, u16)> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;

    let mut words = Vec::with_capacity(4);
    for chunk in addr.as_bytes().chunks(8) {
        let word = std::str::from_utf8(chunk).ok()?;
        words.push(u32::from_str_radix(word, 16).ok()?.to_ne_bytes());
    }

    let addr = match words.len() {
        1 => IpAddr::V4(Ipv4Addr::from(words[0])),
        4 => {
            let mut bytes = [0u8; 16];
            for (i, word) in words.iter().enumerate() {
                bytes[i * 4..i * 4 + 4].copy_from_slice(word);
            }
            IpAddr::V6(Ipv6Addr::from(bytes))
        }
        _ => return None,
    };
    Some((addr, port))
}

fn state_name(protocol: &str, state: u8) -> &'static str {
    if protocol == "udp" {
        return match state {
            0x01 => "ESTABLISHED",
            _ => "UNCONNECTED",
        };
    }
    match state {
        0x01 => "ESTABLISHED",
        0x02 => "SYN_SENT",
        0x03 => "SYN_RECV",
        0x04 => "FIN_WAIT1",
        0x05 => "FIN_WAIT2",
        0x06 => "TIME_WAIT",
        0x07 => "CLOSED",
        0x08 => "CLOSE_WAIT",
        0x09 => "LAST_ACK",
        0x0A => "LISTEN",
        0x0B => "CLOSING",
        _ => "UNKNOWN",
    }
}

/// Map socket inodes to the first process found holding them. Processes we
/// may not inspect are skipped.
fn socket_owners(proc_root: &Path) -> HashMap<u64, Owner> {
    let mut owners = HashMap::new();
    let entries = match fs::read_dir(proc_root) {
        Ok(entries) => entries,
        Err(_) => return owners,
    };

    for entry in entries.flatten() {
        let pid: i64 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            Some(pid) => pid,
            None => continue,
        };
        let fds = match fs::read_dir(entry.path().join("fd")) {
            Ok(fds) => fds,
            Err(_) => continue,
        };

        let mut name: Option<Option<String>> = None;
        for fd in fds.flatten() {
            let target = match fs::read_link(fd.path()) {
                Ok(target) => target,
                Err(_) => continue,
            };
            let inode = target
                .to_str()
                .and_then(|t| t.strip_prefix("socket:["))
                .and_then(|t| t.strip_suffix(']'))
                .and_then(|t| t.parse::<u64>().ok());
            if let Some(inode) = inode {
                let name = name
                    .get_or_insert_with(|| {
                        fs::read_to_string(entry.path().join("comm"))
                            .ok()
                            .map(|s| s.trim_end().to_string())
                    })
                    .clone();
                owners.entry(inode).or_insert(Owner { pid, name });
            }
        }
    }
    owners
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_line() {
        let line = "   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 123456 1 0000000000000000 100 0 0 10 0";
        let entry = parse_line(line).unwrap();
        if cfg!(target_endian = "little") {
            assert_eq!(entry.local, ("127.0.0.1".parse().unwrap(), 8080));
        }
        assert_eq!(entry.state, 0x0A);
        assert_eq!(entry.inode, 123456);
        assert_eq!(state_name("tcp", entry.state), "LISTEN");
    }

    #[test]
    fn parses_ipv6_endpoint() {
        let (addr, port) = parse_endpoint("00000000000000000000000001000000:0016").unwrap();
        if cfg!(target_endian = "little") {
            assert_eq!(addr, "::1".parse::<IpAddr>().unwrap());
        }
        assert_eq!(port, 22);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_line("sl local_address rem_address").is_none());
        assert!(parse_endpoint("zz:0016").is_none());
    }
}
