/// Messaging backends (Slack, dry-run log)
pub mod backend;

/// Notification text rendering
pub mod format;

/// Secondary alarm rail
pub mod mirror;

/// State-change alerts, digests and heartbeats
pub mod router;

/// Daily digest thread handles
pub mod thread;

pub use backend::{Ack, LogBackend, MessagingBackend, SlackBackend};
pub use mirror::{AlarmMirror, AlarmTransition, HttpAlarmMirror};
pub use router::{AlertContext, AlertRouter, DigestReceipt, NotifyOutcome};
pub use thread::ThreadRegistry;
