use crate::alerts::format::thread_root_message;
use crate::alerts::MessagingBackend;
use crate::config::Channel;
use crate::error::AlertError;
use crate::state::records::{is_older_than, new_holder_id};
use crate::state::{decode, encode, thread_key, StateStore, ThreadHandle, ThreadRecord};
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Get-or-create of the per-day digest thread
///
/// The slot `thread/<day>` is claimed with a conditional create before the
/// root message is posted, then swapped to `Ready` with the backend's message
/// id. Concurrent callers that lose the claim wait for `Ready` and reuse it.
/// A claim older than `claim_staleness` is taken over; a claimant that fails
/// to post releases its claim.
pub struct ThreadRegistry {
    store: Arc<dyn StateStore>,
    backend: Arc<dyn MessagingBackend>,
    claim_staleness: Duration,
    poll_interval: Duration,
}

impl ThreadRegistry {
    pub fn new(store: Arc<dyn StateStore>, backend: Arc<dyn MessagingBackend>, claim_staleness: Duration) -> Self {
        Self {
            store,
            backend,
            claim_staleness,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn get_or_create(&self, channel: &Channel, day_key: &str) -> Result<ThreadHandle, AlertError> {
        let key = thread_key(day_key);

        loop {
            let claim = ThreadRecord::Claimed {
                holder: new_holder_id(),
                claimed_at: Utc::now(),
            };
            let claim_raw = encode(&key, &claim)?;

            let Some(existing) = self.store.get(&key).await? else {
                if self.store.put_if_absent(&key, claim_raw.clone()).await? {
                    return self.create(channel, day_key, &key, claim_raw).await;
                }
                continue;
            };

            let takeover = match decode::<ThreadRecord>(&key, &existing) {
                Ok(ThreadRecord::Ready { thread_id, .. }) => {
                    debug!("Reusing thread {} for {}", thread_id, day_key);
                    return Ok(ThreadHandle {
                        day_key: day_key.to_string(),
                        thread_id,
                    });
                }
                Ok(ThreadRecord::Claimed { claimed_at, .. }) => {
                    is_older_than(claimed_at, Utc::now(), self.claim_staleness)
                }
                Err(e) => {
                    warn!("Replacing unreadable thread record: {}", e);
                    true
                }
            };

            if takeover {
                warn!("Taking over stale thread claim for {}", day_key);
                if self
                    .store
                    .compare_and_swap(&key, Some(&existing), Some(claim_raw.clone()))
                    .await?
                {
                    return self.create(channel, day_key, &key, claim_raw).await;
                }
                continue;
            }

            debug!("Thread for {} is being created elsewhere, waiting", day_key);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn create(
        &self,
        channel: &Channel,
        day_key: &str,
        key: &str,
        claim_raw: String,
    ) -> Result<ThreadHandle, AlertError> {
        let posted = self
            .backend
            .post_message(channel, &thread_root_message(day_key), None)
            .await;

        let thread_id = match posted {
            Ok(ack) => ack.message_id,
            Err(e) => {
                self.release(key, &claim_raw).await;
                return Err(e);
            }
        };
        let Some(thread_id) = thread_id else {
            self.release(key, &claim_raw).await;
            return Err(AlertError::Delivery(format!(
                "channel {} returned no message id to thread under",
                channel.name
            )));
        };

        let ready = ThreadRecord::Ready {
            thread_id: thread_id.clone(),
            created_at: Utc::now(),
        };
        let ready_raw = encode(key, &ready)?;
        if !self
            .store
            .compare_and_swap(key, Some(&claim_raw), Some(ready_raw))
            .await?
        {
            warn!("Thread claim for {} was taken over during creation", day_key);
        }

        info!("Created thread {} for {}", thread_id, day_key);
        Ok(ThreadHandle {
            day_key: day_key.to_string(),
            thread_id,
        })
    }

    async fn release(&self, key: &str, claim_raw: &str) {
        if let Err(e) = self.store.compare_and_swap(key, Some(claim_raw), None).await {
            warn!("Failed to release thread claim {}: {}", key, e);
        }
    }
}
