//! Endpoint telemetry agent.
//!
//! # Architecture Overview
//!
//! ```text
//!   OS signals ──▶ SignalGateway thread ──▶ Scheduler::terminate
//!                                                  │
//!   ┌──────────────────── control loop (main thread) ▼ ─────────────────┐
//!   │  Scheduler::run_once   timers, queued tasks, bounded wait         │
//!   │  Database::poll        event tables append rows                  │
//!   │  Protocol::poll        sessions, handshakes, queries, heartbeats  │
//!   │  Database::expire      drop rows past retention                   │
//!   └────────────────────────────────────────────────────────────────────┘
//!            ▲ TransportEvent + wake            │ Message
//!            │                                  ▼
//!   ┌──────────── tokio runtime (I/O threads) ───────────────┐
//!   │  TCP + TLS connections to monitoring peers             │
//!   │  Prometheus scrape endpoint (optional)                 │
//!   └────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;

use telemetry_agent::config::{read_config, validate_config, AgentConfig};
use telemetry_agent::lifecycle;
use telemetry_agent::observability::logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "telemetry-agent", version)]
#[command(about = "Exposes live system state as queryable tables to monitoring peers", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run one statement, print the result and exit
    #[arg(short, long, value_name = "STATEMENT")]
    execute: Option<String>,

    /// Peer destination as host[:port]; replaces the configured list
    #[arg(long = "peer", value_name = "HOST[:PORT]")]
    peers: Vec<String>,

    /// Additional group membership
    #[arg(long = "group", value_name = "NAME")]
    groups: Vec<String>,

    /// Log level or filter directive
    #[arg(long)]
    log_level: Option<String>,

    /// Exit when a peer session disconnects
    #[arg(long)]
    terminate_on_disconnect: bool,

    /// Connect to peers without TLS
    #[arg(long)]
    tls_disable: bool,
}

impl Cli {
    fn apply(&self, config: &mut AgentConfig) {
        if !self.peers.is_empty() {
            config.peers.destinations = self.peers.clone();
        }
        config.peers.groups.extend(self.groups.iter().cloned());
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
        if self.terminate_on_disconnect {
            config.peers.terminate_on_disconnect = true;
        }
        if self.tls_disable {
            config.peers.tls.disable = true;
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    let mut config = match &cli.config {
        Some(path) => match read_config(path) {
            Ok(config) => config,
            Err(e) => {
                init_logging(&AgentConfig::default().observability);
                tracing::error!(path = %path.display(), error = %e, "Failed to load configuration");
                return ExitCode::from(1);
            }
        },
        None => AgentConfig::default(),
    };
    cli.apply(&mut config);
    init_logging(&config.observability);

    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            tracing::error!(field = %error.field, message = %error.message, "Invalid configuration");
        }
        return ExitCode::from(1);
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        peers = config.peers.destinations.len(),
        "telemetry-agent starting"
    );

    match lifecycle::run(config, cli.execute) {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Agent stopped");
            ExitCode::from(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_file() {
        let cli = Cli::parse_from([
            "telemetry-agent",
            "--peer",
            "monitor:7000",
            "--group",
            "web",
            "--tls-disable",
            "--log-level",
            "debug",
        ]);
        let mut config = AgentConfig::default();
        config.peers.destinations = vec!["old:1".into()];
        cli.apply(&mut config);

        assert_eq!(config.peers.destinations, vec!["monitor:7000".to_string()]);
        assert_eq!(config.peers.groups, vec!["web".to_string()]);
        assert!(config.peers.tls.disable);
        assert!(!config.peers.terminate_on_disconnect);
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn help_is_not_an_error() {
        let err = Cli::try_parse_from(["telemetry-agent", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }
}
