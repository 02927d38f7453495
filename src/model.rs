//! Core data types shared by the probe, remediation and alerting stages
//!
//! Observations come from the probe engine (or an external health-check
//! provider), verdicts from the classifier, and alarm statuses are what gets
//! persisted per target between invocations.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Upper bound for any probe detail, command output or error text that is
/// logged or rendered into a notification
pub const MAX_DETAIL_LEN: usize = 100;

const JST_OFFSET_SECS: i32 = 9 * 3600;

/// Outcome of a single probe attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ProbeOutcome {
    /// The endpoint answered with a status matching the success criterion
    Success(u16),
    /// The endpoint answered with any other status
    Failure(u16),
    /// Transport-level fault (DNS, TLS, timeout, connection refused)
    Error(String),
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success(_))
    }

    /// Short human-readable detail, e.g. `HTTP 503`
    pub fn detail(&self) -> String {
        match self {
            ProbeOutcome::Success(code) | ProbeOutcome::Failure(code) => format!("HTTP {}", code),
            ProbeOutcome::Error(message) => format!("error: {}", message),
        }
    }
}

/// Result of one probe attempt from one vantage point
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    /// Name of the probed target
    pub target: String,
    /// When the probe completed
    pub timestamp: Timestamp,
    /// What the probe saw
    pub outcome: ProbeOutcome,
    /// Region or vantage point that produced the observation
    pub source: String,
}

impl Observation {
    pub fn new(target: impl Into<String>, outcome: ProbeOutcome, source: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            timestamp: Utc::now(),
            outcome,
            source: source.into(),
        }
    }
}

/// Health classification of a target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Healthy,
    Unhealthy,
    /// No observations were available
    Indeterminate,
}

impl Verdict {
    pub fn is_healthy(self) -> bool {
        self == Verdict::Healthy
    }

    /// Indeterminate is treated the same as Unhealthy for remediation
    pub fn needs_remediation(self) -> bool {
        !self.is_healthy()
    }

    /// Report marker used in digests
    pub fn symbol(self) -> &'static str {
        match self {
            Verdict::Healthy => "[O]",
            Verdict::Unhealthy => "[X]",
            Verdict::Indeterminate => "[?]",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::Healthy => "healthy",
            Verdict::Unhealthy => "unhealthy",
            Verdict::Indeterminate => "indeterminate",
        };
        f.write_str(label)
    }
}

/// Verdict together with the evidence it was derived from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthVerdict {
    pub target: String,
    pub verdict: Verdict,
    /// Number of successful observations
    pub successes: usize,
    /// Number of observations considered
    pub total: usize,
    /// Raw probe result for single observations, ratio otherwise
    pub detail: String,
}

/// Persisted alarm state of a target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmStatus {
    #[default]
    Ok,
    Alarm,
}

impl AlarmStatus {
    pub fn from_verdict(verdict: Verdict) -> Self {
        if verdict.is_healthy() {
            AlarmStatus::Ok
        } else {
            AlarmStatus::Alarm
        }
    }
}

impl fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmStatus::Ok => f.write_str("OK"),
            AlarmStatus::Alarm => f.write_str("ALARM"),
        }
    }
}

/// Japan Standard Time, the zone reports and daily threads are keyed in
pub fn jst() -> FixedOffset {
    FixedOffset::east_opt(JST_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Calendar-day key (`YYYY-MM-DD`, JST) for the given instant
pub fn day_key(at: Timestamp) -> String {
    at.with_timezone(&jst()).format("%Y-%m-%d").to_string()
}

/// Full JST rendering used in notification text
pub fn jst_display(at: Timestamp) -> String {
    at.with_timezone(&jst()).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Truncate text to at most `max_length` bytes without splitting a UTF-8
/// character, marking the cut with `...` when there is room for it
pub fn truncate_text(text: &str, max_length: usize) -> String {
    if text.len() <= max_length {
        return text.to_string();
    }

    let (budget, marker) = if max_length > 3 {
        (max_length - 3, "...")
    } else {
        (max_length, "")
    };

    let mut cut = budget;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }

    format!("{}{}", &text[..cut], marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_probe_outcome_detail() {
        assert_eq!(ProbeOutcome::Success(200).detail(), "HTTP 200");
        assert_eq!(ProbeOutcome::Failure(503).detail(), "HTTP 503");
        assert_eq!(
            ProbeOutcome::Error("connection refused".to_string()).detail(),
            "error: connection refused"
        );
    }

    #[test]
    fn test_probe_outcome_serialization() {
        let json = serde_json::to_string(&ProbeOutcome::Failure(502)).unwrap();
        assert_eq!(json, r#"{"kind":"failure","value":502}"#);
    }

    #[test]
    fn test_alarm_status_serialization() {
        assert_eq!(serde_json::to_string(&AlarmStatus::Ok).unwrap(), "\"OK\"");
        assert_eq!(
            serde_json::to_string(&AlarmStatus::Alarm).unwrap(),
            "\"ALARM\""
        );
    }

    #[test]
    fn test_alarm_status_from_verdict() {
        assert_eq!(AlarmStatus::from_verdict(Verdict::Healthy), AlarmStatus::Ok);
        assert_eq!(
            AlarmStatus::from_verdict(Verdict::Unhealthy),
            AlarmStatus::Alarm
        );
        assert_eq!(
            AlarmStatus::from_verdict(Verdict::Indeterminate),
            AlarmStatus::Alarm
        );
    }

    #[test]
    fn test_day_key_rolls_over_at_jst_midnight() {
        // 14:59 UTC is 23:59 JST, 15:00 UTC is the next JST day
        let before = Utc.with_ymd_and_hms(2026, 10, 14, 14, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 10, 14, 15, 0, 0).unwrap();
        assert_eq!(day_key(before), "2026-10-14");
        assert_eq!(day_key(after), "2026-10-15");
    }

    #[test]
    fn test_jst_display() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(jst_display(at), "2026-01-02 12:04:05");
    }

    #[test]
    fn test_truncate_text_multibyte() {
        let text = "接続エラーが発生しました";
        let truncated = truncate_text(text, 10);
        assert!(truncated.len() <= 10);
        assert!(truncated.ends_with("..."));
        assert!(truncated.starts_with("接続"));
    }

    #[test]
    fn test_truncate_text_short_input_unchanged() {
        assert_eq!(truncate_text("timeout", 100), "timeout");
    }

    #[quickcheck]
    fn prop_truncate_text_never_exceeds_bound(text: String, max: u8) -> bool {
        let max = max as usize;
        let truncated = truncate_text(&text, max);
        truncated.len() <= max || truncated == text
    }
}
