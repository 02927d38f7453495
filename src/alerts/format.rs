//! Notification text rendering

use crate::model::{jst, jst_display, truncate_text, AlarmStatus, HealthVerdict, Timestamp, MAX_DETAIL_LEN};

/// `[2026-10-14 12:00:00] YC2: NG. Reason: HTTP 503`, plus any remediation
/// and verification lines
pub fn state_change_message(
    target: &str,
    status: AlarmStatus,
    reason: &str,
    at: Timestamp,
    remediation: Option<&str>,
    verification: Option<&str>,
) -> String {
    let mut message = match status {
        AlarmStatus::Ok => format!("[{}] {}: OK.", jst_display(at), target),
        AlarmStatus::Alarm => format!(
            "[{}] {}: NG. Reason: {}",
            jst_display(at),
            target,
            truncate_text(reason, MAX_DETAIL_LEN)
        ),
    };
    if let Some(summary) = remediation {
        message.push_str("\nRemediation: ");
        message.push_str(summary);
    }
    if let Some(summary) = verification {
        message.push_str("\nVerification: ");
        message.push_str(summary);
    }
    message
}

pub fn thread_root_message(day_key: &str) -> String {
    format!("Server monitoring report for {}", day_key)
}

/// Digest reply: a header line, then one line per target
pub fn digest_message(at: Timestamp, verdicts: &[HealthVerdict]) -> String {
    let mut message = format!("Periodic report {} JST", at.with_timezone(&jst()).format("%H:%M"));
    for verdict in verdicts {
        message.push_str(&format!(
            "\n{} {}: {} ({})",
            verdict.verdict.symbol(),
            verdict.target,
            verdict.verdict,
            truncate_text(&verdict.detail, MAX_DETAIL_LEN)
        ));
    }
    message
}

pub fn heartbeat_message(target: &str) -> String {
    format!("{} - running normally", target)
}
