//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (intervals > 0, timeout above the hello interval)
//! - Check destination syntax and TLS option combinations
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AgentConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::{AgentConfig, DEFAULT_PEER_PORT};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending option.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate `config`, returning every problem found.
pub fn validate_config(config: &AgentConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let non_zero = [
        ("agent.tick_interval_ms", config.agent.tick_interval_ms),
        ("tables.retention_secs", config.tables.retention_secs),
        ("tables.max_buffered_rows", config.tables.max_buffered_rows as u64),
        ("tables.max_rows_per_poll", config.tables.max_rows_per_poll as u64),
        ("peers.reconnect_interval_secs", config.peers.reconnect_interval_secs),
        ("peers.timeout_secs", config.peers.timeout_secs),
        ("peers.hello_interval_secs", config.peers.hello_interval_secs),
        ("peers.max_queries_per_tick", config.peers.max_queries_per_tick as u64),
    ];
    for (field, value) in non_zero {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if config.peers.timeout_secs <= config.peers.hello_interval_secs {
        errors.push(ValidationError::new(
            "peers.timeout_secs",
            "must exceed peers.hello_interval_secs",
        ));
    }

    for (i, destination) in config.peers.destinations.iter().enumerate() {
        if let Err(reason) = parse_destination(destination) {
            errors.push(ValidationError::new(format!("peers.destinations[{}]", i), reason));
        }
    }

    for (i, group) in config.peers.groups.iter().enumerate() {
        if group.trim().is_empty() {
            errors.push(ValidationError::new(format!("peers.groups[{}]", i), "must not be empty"));
        }
    }

    let tls = &config.peers.tls;
    if tls.certificate.is_some() && tls.key_file.is_none() {
        errors.push(ValidationError::new("peers.tls.key_file", "required when a certificate is set"));
    }
    if tls.key_file.is_some() && tls.certificate.is_none() {
        errors.push(ValidationError::new("peers.tls.certificate", "required when a key file is set"));
    }
    if tls.passphrase.is_some() && tls.key_file.is_none() {
        errors.push(ValidationError::new("peers.tls.passphrase", "requires peers.tls.key_file"));
    }
    if (tls.certificate.is_some() || tls.key_file.is_some()) && tls.ca_file.is_none() && tls.ca_path.is_none() {
        errors.push(ValidationError::new(
            "peers.tls.ca_file",
            "a CA is required when client certificate material is set",
        ));
    }
    if tls.disable && tls.has_material() {
        errors.push(ValidationError::new(
            "peers.tls.disable",
            "conflicts with configured certificate material",
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<std::net::SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "must be a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Split a `host[:port]` destination, defaulting the port.
///
/// IPv6 literals must be bracketed when a port is given (`[::1]:9000`).
pub fn parse_destination(destination: &str) -> Result<(String, u16), String> {
    let destination = destination.trim();
    if destination.is_empty() {
        return Err("empty destination".to_string());
    }

    if let Some(rest) = destination.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("unterminated '[' in '{}'", destination))?;
        let port = match tail {
            "" => DEFAULT_PEER_PORT,
            _ => parse_port(tail.strip_prefix(':').unwrap_or(tail), destination)?,
        };
        return Ok((host.to_string(), port));
    }

    match destination.rsplit_once(':') {
        // Bare IPv6 literal without port.
        Some((host, _)) if host.contains(':') => Ok((destination.to_string(), DEFAULT_PEER_PORT)),
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), parse_port(port, destination)?)),
        Some(_) => Err(format!("missing host in '{}'", destination)),
        None => Ok((destination.to_string(), DEFAULT_PEER_PORT)),
    }
}

fn parse_port(port: &str, destination: &str) -> Result<u16, String> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port in '{}'", destination)),
        Ok(port) => Ok(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&AgentConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = AgentConfig::default();
        config.peers.hello_interval_secs = 0;
        config.peers.timeout_secs = 0;
        config.peers.destinations = vec!["host:notaport".into(), ":9000".into()];

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"peers.hello_interval_secs"));
        assert!(fields.contains(&"peers.timeout_secs"));
        assert!(fields.contains(&"peers.destinations[0]"));
        assert!(fields.contains(&"peers.destinations[1]"));
    }

    #[test]
    fn certificate_without_ca_is_rejected() {
        let mut config = AgentConfig::default();
        config.peers.tls.certificate = Some(PathBuf::from("client.pem"));
        config.peers.tls.key_file = Some(PathBuf::from("client.key"));

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "peers.tls.ca_file");

        config.peers.tls.ca_file = Some(PathBuf::from("ca.pem"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn passphrase_needs_key() {
        let mut config = AgentConfig::default();
        config.peers.tls.passphrase = Some("secret".into());
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "peers.tls.passphrase");
    }

    #[test]
    fn destination_parsing() {
        assert_eq!(parse_destination("monitor"), Ok(("monitor".into(), DEFAULT_PEER_PORT)));
        assert_eq!(parse_destination("10.0.0.1:7000"), Ok(("10.0.0.1".into(), 7000)));
        assert_eq!(parse_destination("[::1]:7000"), Ok(("::1".into(), 7000)));
        assert_eq!(parse_destination("[::1]"), Ok(("::1".into(), DEFAULT_PEER_PORT)));
        assert_eq!(parse_destination("fe80::1"), Ok(("fe80::1".into(), DEFAULT_PEER_PORT)));
        assert!(parse_destination("host:0").is_err());
        assert!(parse_destination("").is_err());
    }
}
