use thiserror::Error;

/// Errors that can occur while building the probe engine
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),
}

/// Errors returned by a state store backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("State store I/O failed: {0}")]
    Io(String),

    #[error("State store lock not acquired within {0:?}")]
    LockTimeout(std::time::Duration),

    #[error("Corrupt state record for key '{key}': {message}")]
    Corrupt { key: String, message: String },
}

/// Errors that can occur while resolving remote-access credentials
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CredentialError {
    #[error("Credential '{0}' not found")]
    NotFound(String),

    #[error("Credential '{reference}' is unusable: {message}")]
    Unusable { reference: String, message: String },
}

/// Errors from the remote execution channel
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Remote command did not finish within {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors that can occur while remediating a target
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemediationError {
    #[error("Remediation already in flight for '{0}'")]
    AlreadyInFlight(String),

    #[error("No remediation configured for '{0}'")]
    NotConfigured(String),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Remote execution timed out after {0:?}")]
    ExecutionTimeout(std::time::Duration),

    #[error("Remote execution failed (exit status {exit_status:?}): {stderr}")]
    ExecutionFailure {
        exit_status: Option<i32>,
        stderr: String,
    },

    #[error("State store error: {0}")]
    State(#[from] StateError),
}

/// Errors that can occur when sending alerts
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlertError {
    #[error("No channel configured for '{0}'")]
    ChannelNotConfigured(String),

    #[error("Failed to deliver notification: {0}")]
    Delivery(String),

    #[error("State store error: {0}")]
    State(#[from] StateError),
}

impl AlertError {
    /// Whether the next cycle may succeed where this one failed
    pub fn is_transient(&self) -> bool {
        !matches!(self, AlertError::ChannelNotConfigured(_))
    }
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_credential_error_converts_into_remediation_error() {
        let err: RemediationError = CredentialError::NotFound("yc2.pem".to_string()).into();
        assert_eq!(
            err.to_string(),
            "Credential error: Credential 'yc2.pem' not found"
        );
    }

    #[test]
    fn test_execution_timeout_message_names_duration() {
        let err = RemediationError::ExecutionTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn test_channel_not_configured_is_permanent() {
        assert!(!AlertError::ChannelNotConfigured("yc2".to_string()).is_transient());
        assert!(AlertError::Delivery("HTTP 500".to_string()).is_transient());
    }
}
