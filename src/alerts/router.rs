use crate::alerts::format::{digest_message, heartbeat_message, state_change_message};
use crate::alerts::{AlarmMirror, MessagingBackend, ThreadRegistry};
use crate::config::{Channel, ChannelEndpoint, Target};
use crate::error::AlertError;
use crate::model::{day_key, AlarmStatus, HealthVerdict, Timestamp};
use crate::state::{alarm_key, decode, encode, AlarmState, StateStore};
use log::{debug, error, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Extra facts carried by a state-change alert
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AlertContext {
    /// Summary of a remediation attempted this cycle
    pub remediation: Option<String>,
    /// Summary of a recovery verification completed this cycle
    pub verification: Option<String>,
    /// The remediation was announced by an earlier cycle; resend only if
    /// that announcement never got through
    #[serde(skip)]
    pub redelivery: bool,
}

impl AlertContext {
    /// Whether the alert reports an action taken, not just a state
    pub fn is_actionable(&self) -> bool {
        self.remediation.is_some() || self.verification.is_some()
    }

    /// Whether the alert reports a remediation run this cycle
    pub fn is_fresh_remediation(&self) -> bool {
        self.remediation.is_some() && !self.redelivery
    }
}

/// What `notify` did for a target
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum NotifyOutcome {
    /// Nothing new to say; no message sent
    Suppressed,
    Delivered { channel: String, status: AlarmStatus },
}

/// Where a digest was posted
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DigestReceipt {
    pub channel: String,
    pub thread_id: Option<String>,
}

/// Routes state-change alerts, digests and heartbeats to their channels
///
/// State-change alerts are deduplicated against the persisted [`AlarmState`]:
/// a message goes out when the status differs from the last delivered one,
/// for every remediation run this cycle, or when a verification (or the
/// redelivery of an earlier remediation) produces a message that differs from
/// the last one delivered. The AlarmState is written only after
/// the backend acknowledges delivery, so a failed delivery is retried by the
/// next cycle.
pub struct AlertRouter {
    store: Arc<dyn StateStore>,
    backend: Arc<dyn MessagingBackend>,
    mirror: Option<Arc<dyn AlarmMirror>>,
    threads: Option<ThreadRegistry>,
    channels: BTreeMap<String, Channel>,
    default_channel: Option<String>,
}

impl AlertRouter {
    pub fn new(
        store: Arc<dyn StateStore>,
        backend: Arc<dyn MessagingBackend>,
        channels: BTreeMap<String, Channel>,
        default_channel: Option<String>,
    ) -> Self {
        Self {
            store,
            backend,
            mirror: None,
            threads: None,
            channels,
            default_channel,
        }
    }

    /// Mirror every delivered state change to a secondary rail
    pub fn with_mirror(mut self, mirror: Arc<dyn AlarmMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Group digests into one thread per day
    pub fn with_threads(mut self, threads: ThreadRegistry) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Notify about a target's computed state
    ///
    /// # Arguments
    ///
    /// * `target` - The target the alert is about
    /// * `status` - State computed for this cycle
    /// * `reason` - Machine-readable reason text (probe detail)
    /// * `context` - Remediation and verification summaries, if any
    /// * `now` - Time used for the message and the persisted transition
    ///
    /// # Errors
    ///
    /// `ChannelNotConfigured` when neither the target nor the router has a
    /// channel, `Delivery` when the backend rejects the message. In both
    /// cases the persisted AlarmState is left untouched.
    pub async fn notify(
        &self,
        target: &Target,
        status: AlarmStatus,
        reason: &str,
        context: &AlertContext,
        now: Timestamp,
    ) -> Result<NotifyOutcome, AlertError> {
        let key = alarm_key(&target.name);
        let raw = self.store.get(&key).await?;
        let current = match raw.as_deref().map(|r| decode::<AlarmState>(&key, r)) {
            Some(Ok(state)) => state,
            Some(Err(e)) => {
                warn!("Resetting unreadable alarm state for {}: {}", target.name, e);
                AlarmState::initial(now)
            }
            None => AlarmState::initial(now),
        };

        let hash = reason_hash(status, reason, context);
        let changed = status != current.status;
        let repeated = current.last_notified_hash.as_deref() == Some(hash.as_str());
        if !changed && !context.is_fresh_remediation() && !(context.is_actionable() && !repeated) {
            debug!("{} remains {}, alert suppressed", target.name, status);
            return Ok(NotifyOutcome::Suppressed);
        }

        let channel = self.target_channel(target)?;
        let text = state_change_message(
            &target.name,
            status,
            reason,
            now,
            context.remediation.as_deref(),
            context.verification.as_deref(),
        );
        if let Err(e) = self.backend.post_message(channel, &text, None).await {
            error!("Failed to deliver alert for {}: {}", target.name, e);
            return Err(e);
        }
        info!("{} -> {} alert delivered to {}", target.name, status, channel.name);

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.trigger(&target.name, status, reason).await {
                warn!("Alarm mirror failed for {}: {}", target.name, e);
            }
        }

        let next = AlarmState {
            status,
            last_transition: if changed { now } else { current.last_transition },
            last_notified_hash: Some(hash),
            last_notified_at: Some(now),
        };
        let next_raw = encode(&key, &next)?;
        if !self
            .store
            .compare_and_swap(&key, raw.as_deref(), Some(next_raw))
            .await?
        {
            warn!(
                "Alarm state for {} changed concurrently; keeping the newer record",
                target.name
            );
        }

        Ok(NotifyOutcome::Delivered {
            channel: channel.name.clone(),
            status,
        })
    }

    /// Post the periodic digest, into today's thread when threading is on
    pub async fn post_digest(
        &self,
        verdicts: &[HealthVerdict],
        now: Timestamp,
    ) -> Result<DigestReceipt, AlertError> {
        let channel = self.default()?;
        let text = digest_message(now, verdicts);

        // Webhook posts return no message id to thread under
        let thread_id = match &self.threads {
            Some(threads) if matches!(channel.endpoint, ChannelEndpoint::Api { .. }) => {
                Some(threads.get_or_create(channel, &day_key(now)).await?.thread_id)
            }
            _ => None,
        };

        self.backend
            .post_message(channel, &text, thread_id.as_deref())
            .await?;
        info!("Digest of {} targets posted to {}", verdicts.len(), channel.name);

        Ok(DigestReceipt {
            channel: channel.name.clone(),
            thread_id,
        })
    }

    /// Send the schedule-driven OK heartbeat for a healthy target
    ///
    /// Never reads or writes AlarmState.
    pub async fn send_heartbeat(&self, target: &Target) -> Result<(), AlertError> {
        let channel = self.target_channel(target)?;
        self.backend
            .post_message(channel, &heartbeat_message(&target.name), None)
            .await?;
        debug!("Heartbeat sent for {}", target.name);
        Ok(())
    }

    /// Target's own channel, falling back to the default channel
    pub fn target_channel(&self, target: &Target) -> Result<&Channel, AlertError> {
        let name = target
            .channel
            .as_deref()
            .or(self.default_channel.as_deref())
            .ok_or_else(|| AlertError::ChannelNotConfigured(target.name.clone()))?;
        self.channels
            .get(name)
            .ok_or_else(|| AlertError::ChannelNotConfigured(target.name.clone()))
    }

    fn default(&self) -> Result<&Channel, AlertError> {
        self.default_channel
            .as_deref()
            .and_then(|name| self.channels.get(name))
            .ok_or_else(|| AlertError::ChannelNotConfigured("digest".to_string()))
    }
}

/// Stable hash of what an alert says, for deduplication
pub fn reason_hash(status: AlarmStatus, reason: &str, context: &AlertContext) -> String {
    let status = status.to_string();
    let mut hasher = Sha256::new();
    for part in [
        Some(status.as_str()),
        Some(reason),
        context.remediation.as_deref(),
        context.verification.as_deref(),
    ] {
        hasher.update(part.unwrap_or("").as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
