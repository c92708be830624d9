//! Process-level error taxonomy.
//!
//! Only errors that end the process live here. Provider and session errors
//! are handled where they occur and never reach `main`; query errors do only
//! in one-shot statement mode.

use thiserror::Error;

use crate::config::loader::ConfigError;
use crate::database::{QueryError, RegistrationError};
use crate::lifecycle::signals::SignalError;
use crate::net::tls::TlsError;

/// Errors that terminate the agent with a non-zero exit code.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The process cannot continue safely.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// A one-shot statement could not be executed.
    #[error("query failed: {0}")]
    Query(#[from] QueryError),
}

impl AgentError {
    /// Exit code reported to the operating system.
    pub fn exit_code(&self) -> u8 {
        1
    }
}

impl From<ConfigError> for AgentError {
    fn from(e: ConfigError) -> Self {
        AgentError::Fatal(e.to_string())
    }
}

impl From<SignalError> for AgentError {
    fn from(e: SignalError) -> Self {
        match e {
            SignalError::Mask(_) | SignalError::Spawn(_) => AgentError::Fatal(e.to_string()),
            SignalError::Reserved(_) | SignalError::Unmanaged(_) => {
                AgentError::Internal(e.to_string())
            }
        }
    }
}

impl From<RegistrationError> for AgentError {
    fn from(e: RegistrationError) -> Self {
        AgentError::Internal(e.to_string())
    }
}

impl From<TlsError> for AgentError {
    fn from(e: TlsError) -> Self {
        AgentError::Fatal(format!("TLS setup failed: {}", e))
    }
}

/// Result type for agent startup and the control loop.
pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn signal_errors_map_to_taxonomy() {
        let err: AgentError = SignalError::Reserved(Signal::SIGUSR1).into();
        assert!(matches!(err, AgentError::Internal(_)));

        let err: AgentError = SignalError::Mask(nix::errno::Errno::EINVAL).into();
        assert!(matches!(err, AgentError::Fatal(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn duplicate_table_is_internal() {
        let err: AgentError = RegistrationError::Duplicate("processes".into()).into();
        assert!(matches!(err, AgentError::Internal(_)));
        assert!(err.to_string().contains("processes"));
    }
}
