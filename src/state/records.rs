use crate::model::{AlarmStatus, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Persisted alarm state of one target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmState {
    pub status: AlarmStatus,
    pub last_transition: Timestamp,
    /// Hash of the last delivered (status, reason) pair
    pub last_notified_hash: Option<String>,
    pub last_notified_at: Option<Timestamp>,
}

impl AlarmState {
    /// State assumed for a target that has never been notified about
    pub fn initial(at: Timestamp) -> Self {
        Self {
            status: AlarmStatus::Ok,
            last_transition: at,
            last_notified_hash: None,
            last_notified_at: None,
        }
    }
}

/// Mutual-exclusion marker for an in-flight remediation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InFlightMarker {
    /// Unique per acquisition, so a release only clears its own marker
    pub holder: String,
    pub acquired_at: Timestamp,
}

impl InFlightMarker {
    pub fn is_stale(&self, now: Timestamp, max_staleness: Duration) -> bool {
        is_older_than(self.acquired_at, now, max_staleness)
    }
}

/// Daily thread slot: either claimed by a caller creating the root message,
/// or ready with the backend's thread identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ThreadRecord {
    Claimed {
        holder: String,
        claimed_at: Timestamp,
    },
    Ready {
        thread_id: String,
        created_at: Timestamp,
    },
}

/// Identifier grouping one day's digests into a single conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadHandle {
    pub day_key: String,
    pub thread_id: String,
}

/// A recovery check scheduled to run once the cool-down has elapsed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingVerification {
    pub target: String,
    pub scheduled_at: Timestamp,
    pub due_at: Timestamp,
    /// One-line summary of the remediation that prompted the check
    pub remediation_summary: String,
    /// Verdict detail of the cycle that remediated
    #[serde(default)]
    pub reason: String,
    /// Set while a caller verifies and reports; cleared if the report fails
    #[serde(default)]
    pub claimed_at: Option<Timestamp>,
}

impl PendingVerification {
    pub fn is_due(&self, now: Timestamp) -> bool {
        now >= self.due_at
    }
}

static HOLDER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Identifier unique to one lock acquisition across processes and tasks
pub(crate) fn new_holder_id() -> String {
    let now = Utc::now();
    format!(
        "{}-{}-{}",
        std::process::id(),
        now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros()),
        HOLDER_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

pub(crate) fn is_older_than(since: Timestamp, now: Timestamp, window: Duration) -> bool {
    match chrono::Duration::from_std(window) {
        Ok(window) => now - since > window,
        // Windows too large for chrono never expire
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_in_flight_marker_staleness() {
        let acquired = Utc.with_ymd_and_hms(2026, 10, 14, 0, 0, 0).unwrap();
        let marker = InFlightMarker {
            holder: "a".to_string(),
            acquired_at: acquired,
        };
        let window = Duration::from_secs(900);

        assert!(!marker.is_stale(acquired + chrono::Duration::seconds(900), window));
        assert!(marker.is_stale(acquired + chrono::Duration::seconds(901), window));
    }

    #[test]
    fn test_thread_record_serialization() {
        let record = ThreadRecord::Ready {
            thread_id: "1760400000.000100".to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 10, 14, 0, 0, 0).unwrap(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""state":"ready""#));
        let back: ThreadRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_pending_verification_due() {
        let scheduled = Utc.with_ymd_and_hms(2026, 10, 14, 0, 0, 0).unwrap();
        let pending = PendingVerification {
            target: "YC2".to_string(),
            scheduled_at: scheduled,
            due_at: scheduled + chrono::Duration::minutes(5),
            remediation_summary: "exit 0".to_string(),
            reason: "HTTP 503".to_string(),
            claimed_at: None,
        };
        assert!(!pending.is_due(scheduled + chrono::Duration::minutes(4)));
        assert!(pending.is_due(scheduled + chrono::Duration::minutes(5)));
    }

    #[test]
    fn test_pending_verification_without_claim_fields() {
        let json = r#"{"target":"YC2","scheduled_at":"2026-10-14T00:00:00Z","due_at":"2026-10-14T00:05:00Z","remediation_summary":"exit 0"}"#;
        let pending: PendingVerification = serde_json::from_str(json).unwrap();
        assert_eq!(pending.reason, "");
        assert_eq!(pending.claimed_at, None);
    }
}
