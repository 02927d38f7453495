use crate::error::ConfigError;
use serde::Deserialize;
use std::time::Duration;

/// One `[[targets]]` entry as written in the configuration file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub name: String,
    pub url: String,
    /// Exact status code required for success; any 2xx when absent
    pub expected_status: Option<u16>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub remediation_command: Option<String>,
    pub credential: Option<String>,
    pub channel: Option<String>,
    pub probe_timeout_seconds: Option<u64>,
    pub remediation_timeout_seconds: Option<u64>,
    pub cooldown_seconds: Option<u64>,
}

/// How to reach a target's host and which fixed command restarts it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationSpec {
    pub host: String,
    pub user: String,
    /// Static command template, never interpolated with runtime input
    pub command: String,
    /// Reference handed to the credential provider
    pub credential: String,
}

/// A monitored endpoint, resolved and immutable for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub url: String,
    pub expected_status: Option<u16>,
    pub remediation: Option<RemediationSpec>,
    pub channel: Option<String>,
    pub probe_timeout: Duration,
    pub remediation_timeout: Duration,
    pub cooldown: Duration,
}

/// Durations applied to targets that do not override them
#[derive(Debug, Clone, Copy)]
pub(crate) struct TargetDefaults {
    pub probe_timeout: Duration,
    pub remediation_timeout: Duration,
    pub cooldown: Duration,
}

impl Target {
    /// Whether an HTTP status satisfies this target's success criterion
    pub fn is_success_status(&self, status: u16) -> bool {
        match self.expected_status {
            Some(expected) => status == expected,
            None => (200..300).contains(&status),
        }
    }

    /// Minimal target for tests and tooling: probe-only, 2xx success,
    /// default timings
    pub fn probe_only(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            expected_status: None,
            remediation: None,
            channel: None,
            probe_timeout: Duration::from_secs(10),
            remediation_timeout: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
        }
    }

    pub(crate) fn resolve(raw: TargetConfig, defaults: TargetDefaults) -> Result<Self, ConfigError> {
        let name = raw.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::ValidationError(
                "target name must not be empty".to_string(),
            ));
        }

        if !(raw.url.starts_with("http://") || raw.url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "target '{}': url must start with http:// or https://",
                name
            )));
        }

        let remediation = match (raw.host, raw.user, raw.remediation_command, raw.credential) {
            (None, None, None, None) => None,
            (Some(host), Some(user), Some(command), Some(credential)) => {
                if command.trim().is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "target '{}': remediation_command must not be empty",
                        name
                    )));
                }
                Some(RemediationSpec {
                    host,
                    user,
                    command,
                    credential,
                })
            }
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "target '{}': host, user, remediation_command and credential must be set together",
                    name
                )))
            }
        };

        let probe_timeout = raw
            .probe_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.probe_timeout);
        if probe_timeout.is_zero() {
            return Err(ConfigError::ValidationError(format!(
                "target '{}': probe timeout must be positive",
                name
            )));
        }

        Ok(Self {
            name,
            url: raw.url,
            expected_status: raw.expected_status,
            remediation,
            channel: raw.channel,
            probe_timeout,
            remediation_timeout: raw
                .remediation_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.remediation_timeout),
            cooldown: raw
                .cooldown_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.cooldown),
        })
    }
}
