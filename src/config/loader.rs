//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::AgentConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Why a configuration could not be loaded.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read configuration file: {}", e),
            ConfigError::Parse(e) => write!(f, "malformed configuration file: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "invalid configuration: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parse a TOML file without validating it.
///
/// Command line overrides are applied between parsing and validation.
pub fn read_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    toml::from_str(&content).map_err(ConfigError::Parse)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    let config = read_config(path)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_valid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[peers]\ndestinations = [\"127.0.0.1:9000\"]\ngroups = [\"web\"]").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.peers.groups, vec!["web"]);
    }

    #[test]
    fn reports_parse_and_validation_errors() {
        let mut bad_syntax = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad_syntax, "[peers\n").unwrap();
        assert!(matches!(load_config(bad_syntax.path()), Err(ConfigError::Parse(_))));

        let mut bad_values = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad_values, "[peers]\ntimeout_secs = 5\nhello_interval_secs = 10").unwrap();
        let err = load_config(bad_values.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("peers.timeout_secs"));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            load_config(Path::new("/nonexistent/agent.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
