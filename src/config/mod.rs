//! Configuration loading and validation
//!
//! The configuration is read from a TOML file once at startup, validated, and
//! resolved into an immutable [`Config`] that the rest of the engine shares.
//! Secrets (bot token, webhook URLs) can be referenced by environment
//! variable name instead of being written into the file.

mod target;

pub use target::{RemediationSpec, Target, TargetConfig};

use crate::error::ConfigError;
use chrono::NaiveTime;
use log::warn;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use target::TargetDefaults;

/// Timeouts, windows and concurrency limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    pub probe_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub remediation_timeout_seconds: u64,
    pub cooldown_seconds: u64,
    pub invocation_budget_seconds: u64,
    pub in_flight_staleness_seconds: u64,
    pub thread_claim_staleness_seconds: u64,
    pub max_concurrency: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            probe_timeout_seconds: 10,
            connect_timeout_seconds: 30,
            remediation_timeout_seconds: 60,
            cooldown_seconds: 300,
            invocation_budget_seconds: 240,
            in_flight_staleness_seconds: 900,
            thread_claim_staleness_seconds: 60,
            max_concurrency: 8,
        }
    }
}

impl TimingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn invocation_budget(&self) -> Duration {
        Duration::from_secs(self.invocation_budget_seconds)
    }

    pub fn in_flight_staleness(&self) -> Duration {
        Duration::from_secs(self.in_flight_staleness_seconds)
    }

    pub fn thread_claim_staleness(&self) -> Duration {
        Duration::from_secs(self.thread_claim_staleness_seconds)
    }
}

/// Optional pipeline stages, enabled per deployment
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageConfig {
    pub remediation: bool,
    pub verification: bool,
    pub threading: bool,
    pub ok_heartbeat: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            remediation: true,
            verification: true,
            threading: true,
            ok_heartbeat: false,
        }
    }
}

/// Where cross-invocation state lives
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum StateConfig {
    Memory,
    File { path: PathBuf },
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig::File {
            path: PathBuf::from("sentinel-state.json"),
        }
    }
}

/// Messaging backend selection
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum MessagingConfig {
    Slack {
        #[serde(default = "default_bot_token_env")]
        bot_token_env: String,
        #[serde(default = "default_slack_api_base")]
        api_base: String,
    },
    /// Dry run: messages are logged instead of delivered
    Log,
}

fn default_bot_token_env() -> String {
    "SLACK_BOT_TOKEN".to_string()
}

fn default_slack_api_base() -> String {
    "https://slack.com/api".to_string()
}

impl Default for MessagingConfig {
    fn default() -> Self {
        MessagingConfig::Slack {
            bot_token_env: default_bot_token_env(),
            api_base: default_slack_api_base(),
        }
    }
}

/// One `[channels.<name>]` entry as written in the configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub channel_id: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_url_env: Option<String>,
}

/// Resolved delivery endpoint of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEndpoint {
    /// Bot API channel; supports threads and returns message ids
    Api { channel_id: String },
    /// Incoming webhook; no threads, no message ids
    Webhook { url: String },
}

/// A named notification channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
    pub endpoint: ChannelEndpoint,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialsConfig {
    /// Directory holding one private key file per credential reference
    pub key_dir: PathBuf,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from("/etc/sentinel/keys"),
        }
    }
}

/// Secondary notification rail mirroring every state-change message
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AlarmMirrorConfig {
    pub url: String,
    #[serde(default = "default_alarm_prefix")]
    pub alarm_prefix: String,
}

fn default_alarm_prefix() -> String {
    "sentinel".to_string()
}

/// Cadences used by `watch` mode
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    pub check_interval_seconds: u64,
    /// `HH:MM` in JST
    pub digest_times: Vec<String>,
    pub heartbeat_interval_seconds: Option<u64>,
    pub verification_sweep_seconds: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 1200,
            digest_times: vec!["09:00".to_string(), "18:00".to_string()],
            heartbeat_interval_seconds: None,
            verification_sweep_seconds: 30,
        }
    }
}

/// The configuration file as written on disk
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    default_channel: Option<String>,
    #[serde(default)]
    timing: TimingConfig,
    #[serde(default)]
    stages: StageConfig,
    #[serde(default)]
    state: StateConfig,
    #[serde(default)]
    messaging: MessagingConfig,
    #[serde(default)]
    channels: BTreeMap<String, ChannelConfig>,
    #[serde(default)]
    credentials: CredentialsConfig,
    alarm_mirror: Option<AlarmMirrorConfig>,
    #[serde(default)]
    schedule: ScheduleConfig,
    #[serde(default)]
    targets: Vec<TargetConfig>,
}

/// Validated, resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub default_channel: Option<String>,
    pub timing: TimingConfig,
    pub stages: StageConfig,
    pub state: StateConfig,
    pub messaging: MessagingConfig,
    /// Channels whose endpoint could be resolved at startup
    pub channels: BTreeMap<String, Channel>,
    pub credentials: CredentialsConfig,
    pub alarm_mirror: Option<AlarmMirrorConfig>,
    pub schedule: ScheduleConfig,
    pub digest_times: Vec<NaiveTime>,
    pub targets: Vec<Target>,
}

impl Config {
    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(contents)?;
        Self::resolve(file, |name| std::env::var(name).ok())
    }

    fn resolve(
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if file.timing.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "timing.max_concurrency must be at least 1".to_string(),
            ));
        }
        if file.timing.invocation_budget_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "timing.invocation_budget_seconds must be positive".to_string(),
            ));
        }

        let channels = Self::resolve_channels(&file.channels, env)?;

        let defaults = TargetDefaults {
            probe_timeout: Duration::from_secs(file.timing.probe_timeout_seconds),
            remediation_timeout: Duration::from_secs(file.timing.remediation_timeout_seconds),
            cooldown: Duration::from_secs(file.timing.cooldown_seconds),
        };

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(file.targets.len());
        for raw in file.targets {
            let target = Target::resolve(raw, defaults)?;
            if !seen.insert(target.name.clone()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
            if let Some(ref channel) = target.channel {
                if !file.channels.contains_key(channel) {
                    return Err(ConfigError::ValidationError(format!(
                        "target '{}' references undefined channel '{}'",
                        target.name, channel
                    )));
                }
            }
            targets.push(target);
        }

        if targets.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one [[targets]] entry is required".to_string(),
            ));
        }

        if let Some(ref channel) = file.default_channel {
            if !file.channels.contains_key(channel) {
                return Err(ConfigError::ValidationError(format!(
                    "default_channel references undefined channel '{}'",
                    channel
                )));
            }
        }

        let digest_times = file
            .schedule
            .digest_times
            .iter()
            .map(|raw| {
                NaiveTime::parse_from_str(raw, "%H:%M").map_err(|e| {
                    ConfigError::ValidationError(format!(
                        "schedule.digest_times entry '{}' is not HH:MM: {}",
                        raw, e
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            default_channel: file.default_channel,
            timing: file.timing,
            stages: file.stages,
            state: file.state,
            messaging: file.messaging,
            channels,
            credentials: file.credentials,
            alarm_mirror: file.alarm_mirror,
            schedule: file.schedule,
            digest_times,
            targets,
        })
    }

    fn resolve_channels(
        raw: &BTreeMap<String, ChannelConfig>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<BTreeMap<String, Channel>, ConfigError> {
        let mut channels = BTreeMap::new();

        for (name, channel) in raw {
            let endpoint = match (
                &channel.channel_id,
                &channel.webhook_url,
                &channel.webhook_url_env,
            ) {
                (Some(id), None, None) => ChannelEndpoint::Api {
                    channel_id: id.clone(),
                },
                (None, Some(url), None) => ChannelEndpoint::Webhook { url: url.clone() },
                (None, None, Some(var)) => match env(var) {
                    Some(url) if !url.is_empty() => ChannelEndpoint::Webhook { url },
                    _ => {
                        // Left unresolved; notifications to it fail as not configured
                        warn!(
                            "Channel '{}': environment variable {} is not set",
                            name, var
                        );
                        continue;
                    }
                },
                _ => {
                    return Err(ConfigError::ValidationError(format!(
                        "channel '{}' must set exactly one of channel_id, webhook_url, webhook_url_env",
                        name
                    )))
                }
            };

            channels.insert(
                name.clone(),
                Channel {
                    name: name.clone(),
                    endpoint,
                },
            );
        }

        Ok(channels)
    }

    /// Look up a target by name
    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
default_channel = "ops"

[timing]
probe_timeout_seconds = 5
cooldown_seconds = 120

[stages]
ok_heartbeat = true

[state]
kind = "memory"

[messaging]
kind = "log"

[channels.ops]
channel_id = "C0123456"

[channels.yc2]
webhook_url = "https://hooks.example.com/yc2"

[schedule]
digest_times = ["08:30", "20:00"]

[[targets]]
name = "YC2"
url = "https://yc2.example.com"
channel = "yc2"
host = "10.0.0.2"
user = "bitnami"
remediation_command = "sudo /opt/bitnami/ctlscript.sh restart apache"
credential = "server-001-key.pem"

[[targets]]
name = "DBC"
url = "https://dbc.example.com/wp-login.php"
expected_status = 200
probe_timeout_seconds = 20
"#;

    fn resolve_with_env(contents: &str, vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let file: ConfigFile = toml::from_str(contents)?;
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::resolve(file, move |name| {
            vars.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        })
    }

    #[test]
    fn test_parse_sample_config() {
        let config = Config::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.default_channel.as_deref(), Some("ops"));
        assert_eq!(config.state, StateConfig::Memory);
        assert_eq!(config.messaging, MessagingConfig::Log);
        assert!(config.stages.ok_heartbeat);
        assert!(config.stages.remediation);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.digest_times.len(), 2);

        let yc2 = config.target("YC2").unwrap();
        assert_eq!(yc2.probe_timeout, Duration::from_secs(5));
        assert_eq!(yc2.cooldown, Duration::from_secs(120));
        assert!(yc2.remediation.is_some());

        let dbc = config.target("DBC").unwrap();
        assert_eq!(dbc.probe_timeout, Duration::from_secs(20));
        assert_eq!(dbc.expected_status, Some(200));
        assert!(dbc.remediation.is_none());

        assert_eq!(
            config.channels["yc2"].endpoint,
            ChannelEndpoint::Webhook {
                url: "https://hooks.example.com/yc2".to_string()
            }
        );
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.targets.len(), 2);
    }

    #[test]
    fn test_from_missing_file_is_read_error() {
        let err = Config::from_file(Path::new("/nonexistent/sentinel.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_)));
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_toml_str(
            r#"
[[targets]]
name = "Keepa"
url = "https://keepa.example.com"
"#,
        )
        .unwrap();

        assert_eq!(config.timing.probe_timeout_seconds, 10);
        assert_eq!(config.timing.max_concurrency, 8);
        assert!(config.stages.threading);
        assert!(!config.stages.ok_heartbeat);
        assert!(matches!(config.messaging, MessagingConfig::Slack { .. }));
        assert!(matches!(config.state, StateConfig::File { .. }));
        assert_eq!(config.targets[0].cooldown, Duration::from_secs(300));
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let err = Config::from_toml_str(
            r#"
[[targets]]
name = "YC3"
url = "https://a.example.com"

[[targets]]
name = "YC3"
url = "https://b.example.com"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate target name"));
    }

    #[test]
    fn test_undefined_channel_rejected() {
        let err = Config::from_toml_str(
            r#"
[[targets]]
name = "YC3"
url = "https://a.example.com"
channel = "missing"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("undefined channel"));
    }

    #[test]
    fn test_no_targets_rejected() {
        let err = Config::from_toml_str("default_channel = \"ops\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = Config::from_toml_str(
            r#"
[[targets]]
name = "YC3"
url = "https://a.example.com"
restart = "reboot"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::TomlError(_)));
    }

    #[test]
    fn test_bad_digest_time_rejected() {
        let err = Config::from_toml_str(
            r#"
[schedule]
digest_times = ["25:99"]

[[targets]]
name = "YC3"
url = "https://a.example.com"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("HH:MM"));
    }

    #[test]
    fn test_webhook_url_from_env() {
        let contents = r#"
[channels.labor]
webhook_url_env = "LABOR_HACK_SLACK_WEBHOOK"

[[targets]]
name = "Labor-Hack"
url = "https://labor.example.com"
channel = "labor"
"#;
        let config = resolve_with_env(
            contents,
            &[("LABOR_HACK_SLACK_WEBHOOK", "https://hooks.example.com/labor")],
        )
        .unwrap();
        assert_eq!(
            config.channels["labor"].endpoint,
            ChannelEndpoint::Webhook {
                url: "https://hooks.example.com/labor".to_string()
            }
        );

        // Unset variable leaves the channel unresolved rather than failing startup
        let config = resolve_with_env(contents, &[]).unwrap();
        assert!(!config.channels.contains_key("labor"));
    }

    #[test]
    fn test_ambiguous_channel_rejected() {
        let err = Config::from_toml_str(
            r#"
[channels.ops]
channel_id = "C1"
webhook_url = "https://hooks.example.com/ops"

[[targets]]
name = "YC3"
url = "https://a.example.com"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }
}
