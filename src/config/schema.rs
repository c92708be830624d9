//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the agent.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Port used for destinations given without one.
pub const DEFAULT_PEER_PORT: u16 = 9999;

/// Root configuration for the agent.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Identity and control loop settings.
    pub agent: AgentSection,

    /// Table buffering and provider settings.
    pub tables: TablesConfig,

    /// Remote monitoring peers.
    pub peers: PeerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Identity and control loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentSection {
    /// Fixed agent ID; overrides the ID file when set.
    pub id: Option<String>,

    /// File holding the persistent agent ID.
    pub id_file: PathBuf,

    /// Upper bound on one control loop wait, in milliseconds.
    pub tick_interval_ms: u64,

    /// Interval of the status log line in seconds (0 disables it).
    pub status_interval_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: None,
            id_file: PathBuf::from("telemetry-agent.id"),
            tick_interval_ms: 100,
            status_interval_secs: 60,
        }
    }
}

impl AgentSection {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// `None` when the status line is disabled.
    pub fn status_interval(&self) -> Option<Duration> {
        match self.status_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Table buffering and provider settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TablesConfig {
    /// Event rows older than this are expired, in seconds.
    pub retention_secs: u64,

    /// Maximum rows buffered per event table.
    pub max_buffered_rows: usize,

    /// Maximum rows an event provider returns from one poll.
    pub max_rows_per_poll: usize,

    /// Log file tailed by the `system_logs` table.
    pub system_log_path: PathBuf,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            retention_secs: 300,
            max_buffered_rows: 10_000,
            max_rows_per_poll: 1_000,
            system_log_path: PathBuf::from("/var/log/syslog"),
        }
    }
}

/// Remote peer settings shared by every destination.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Destinations as `host[:port]`.
    pub destinations: Vec<String>,

    /// Extra groups announced in the hello, next to `all` and the OS name.
    pub groups: Vec<String>,

    /// Delay before reconnecting after a disconnect, in seconds.
    pub reconnect_interval_secs: u64,

    /// Inactivity after which a session is torn down, in seconds.
    pub timeout_secs: u64,

    /// Interval between hello messages on an established session, in seconds.
    pub hello_interval_secs: u64,

    /// Terminate the agent instead of reconnecting.
    pub terminate_on_disconnect: bool,

    /// Maximum queries executed per control loop tick across all sessions.
    pub max_queries_per_tick: usize,

    /// Transport encryption settings.
    pub tls: TlsSettings,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            groups: Vec::new(),
            reconnect_interval_secs: 30,
            timeout_secs: 300,
            hello_interval_secs: 60,
            terminate_on_disconnect: false,
            max_queries_per_tick: 10,
            tls: TlsSettings::default(),
        }
    }
}

impl PeerConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn hello_interval(&self) -> Duration {
        Duration::from_secs(self.hello_interval_secs)
    }
}

/// TLS settings for peer connections.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsSettings {
    /// Send plaintext frames.
    pub disable: bool,

    /// CA bundle (PEM) used to verify peers.
    pub ca_file: Option<PathBuf>,

    /// Directory of CA certificates (PEM) used to verify peers.
    pub ca_path: Option<PathBuf>,

    /// Client certificate chain (PEM).
    pub certificate: Option<PathBuf>,

    /// Private key for the client certificate (PEM).
    pub key_file: Option<PathBuf>,

    /// Passphrase of an encrypted PKCS#8 key.
    pub passphrase: Option<String>,
}

impl TlsSettings {
    /// True once any CA or certificate option is set, which makes peer
    /// verification mandatory.
    pub fn has_material(&self) -> bool {
        self.ca_file.is_some()
            || self.ca_path.is_some()
            || self.certificate.is_some()
            || self.key_file.is_some()
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: AgentConfig = toml::from_str("[peers]\ndestinations = [\"monitor.example:9000\"]\n").unwrap();
        assert_eq!(config.peers.destinations, vec!["monitor.example:9000"]);
        assert_eq!(config.peers.hello_interval_secs, 60);
        assert_eq!(config.agent.tick_interval(), Duration::from_millis(100));
        assert!(!config.peers.tls.has_material());
    }

    #[test]
    fn zero_status_interval_disables_the_status_line() {
        let config: AgentConfig = toml::from_str("[agent]\nstatus_interval_secs = 0\n").unwrap();
        assert_eq!(config.agent.status_interval(), None);
        assert_eq!(
            AgentSection::default().status_interval(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn tls_and_format_sections() {
        let config: AgentConfig = toml::from_str(
            r#"
            [peers.tls]
            ca_file = "/etc/agent/ca.pem"

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();
        assert!(config.peers.tls.has_material());
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }
}
