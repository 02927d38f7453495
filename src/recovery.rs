//! Deferred post-remediation verification
//!
//! After a remediation, a [`PendingVerification`] is written under
//! `verify/<target>` with the instant the cool-down ends. Nothing waits for
//! it: a later cycle or the verification sweep picks the record up once it is
//! due, claims it with a compare-and-swap, re-probes the target and reports
//! whether recovery is confirmed. The record is deleted only once the result
//! has been reported; a failed report hands the claim back, and a claim left
//! behind by a cancelled invocation is taken over after a staleness window.

use crate::config::Target;
use crate::error::StateError;
use crate::model::{HealthVerdict, Timestamp};
use crate::probe::{classify, ObservationSource};
use crate::state::records::is_older_than;
use crate::state::{decode, encode, load, verification_key, PendingVerification, StateStore};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Result of re-probing a remediated target
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Confirmed,
    StillFailing,
}

/// A completed verification together with its evidence
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VerificationResult {
    pub outcome: RecoveryOutcome,
    pub verdict: HealthVerdict,
    pub remediation_summary: String,
}

impl VerificationResult {
    pub fn summary(&self) -> String {
        match self.outcome {
            RecoveryOutcome::Confirmed => {
                format!("recovery confirmed after restart ({})", self.verdict.detail)
            }
            RecoveryOutcome::StillFailing => {
                format!("still failing after restart ({})", self.verdict.detail)
            }
        }
    }
}

/// What a per-target verification check found
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationCheck {
    /// No verification is scheduled for the target
    NotScheduled,
    /// Scheduled, but the cool-down has not elapsed or another caller is
    /// reporting it
    NotDue(PendingVerification),
    /// Verified; the claim must be passed to `finish` or `release`
    Completed(VerificationResult, VerificationClaim),
}

/// A verification record held by the caller that verified it
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationClaim {
    key: String,
    raw: String,
    pending: PendingVerification,
}

impl VerificationClaim {
    pub fn pending(&self) -> &PendingVerification {
        &self.pending
    }
}

/// Claims older than this belong to an invocation that never reported
pub const DEFAULT_CLAIM_STALENESS: Duration = Duration::from_secs(300);

pub struct RecoveryVerifier {
    store: Arc<dyn StateStore>,
    source: Arc<dyn ObservationSource>,
    claim_staleness: Duration,
}

impl RecoveryVerifier {
    pub fn new(store: Arc<dyn StateStore>, source: Arc<dyn ObservationSource>) -> Self {
        Self {
            store,
            source,
            claim_staleness: DEFAULT_CLAIM_STALENESS,
        }
    }

    pub fn with_claim_staleness(mut self, claim_staleness: Duration) -> Self {
        self.claim_staleness = claim_staleness;
        self
    }

    /// Schedule a verification `after` the given instant
    ///
    /// Replaces any verification already scheduled for the target. `reason`
    /// is the verdict detail that led to the remediation.
    pub async fn schedule(
        &self,
        target: &Target,
        after: Duration,
        remediation_summary: &str,
        reason: &str,
        now: Timestamp,
    ) -> Result<PendingVerification, StateError> {
        let key = verification_key(&target.name);
        let delay = chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::zero());
        let pending = PendingVerification {
            target: target.name.clone(),
            scheduled_at: now,
            due_at: now + delay,
            remediation_summary: remediation_summary.to_string(),
            reason: reason.to_string(),
            claimed_at: None,
        };
        self.store.put(&key, encode(&key, &pending)?).await?;
        info!(
            "Verification of {} scheduled for {}",
            target.name, pending.due_at
        );
        Ok(pending)
    }

    pub async fn pending(&self, target: &str) -> Result<Option<PendingVerification>, StateError> {
        Ok(load(self.store.as_ref(), &verification_key(target))
            .await?
            .map(|(_, pending)| pending))
    }

    /// Re-probe the target now and classify the result
    pub async fn verify(&self, target: &Target, remediation_summary: &str) -> VerificationResult {
        let observations = self.source.observe(target).await;
        let verdict = classify(&target.name, &observations);
        let outcome = if verdict.verdict.is_healthy() {
            RecoveryOutcome::Confirmed
        } else {
            RecoveryOutcome::StillFailing
        };

        match outcome {
            RecoveryOutcome::Confirmed => info!("Recovery of {} confirmed", target.name),
            RecoveryOutcome::StillFailing => {
                warn!("{} still failing after remediation: {}", target.name, verdict.detail)
            }
        }

        VerificationResult {
            outcome,
            verdict,
            remediation_summary: remediation_summary.to_string(),
        }
    }

    /// Run the target's scheduled verification if its cool-down has elapsed
    ///
    /// The record is claimed before probing, so concurrent callers verify a
    /// given schedule at most once; a caller that loses the race sees
    /// `NotScheduled` or `NotDue`. An unreadable record is discarded.
    pub async fn verify_if_due(
        &self,
        target: &Target,
        now: Timestamp,
    ) -> Result<VerificationCheck, StateError> {
        let key = verification_key(&target.name);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(VerificationCheck::NotScheduled);
        };
        let pending = match decode::<PendingVerification>(&key, &raw) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Discarding unreadable verification record for {}: {}", target.name, e);
                self.store.compare_and_swap(&key, Some(&raw), None).await?;
                return Ok(VerificationCheck::NotScheduled);
            }
        };

        if let Some(claimed_at) = pending.claimed_at {
            if !is_older_than(claimed_at, now, self.claim_staleness) {
                debug!("Verification of {} is being reported elsewhere", target.name);
                return Ok(VerificationCheck::NotDue(pending));
            }
            warn!(
                "Taking over verification of {} claimed at {}",
                target.name, claimed_at
            );
        }

        if !pending.is_due(now) {
            debug!("Verification of {} not due until {}", target.name, pending.due_at);
            return Ok(VerificationCheck::NotDue(pending));
        }

        let claimed = PendingVerification {
            claimed_at: Some(now),
            ..pending
        };
        let claimed_raw = encode(&key, &claimed)?;
        if !self
            .store
            .compare_and_swap(&key, Some(&raw), Some(claimed_raw.clone()))
            .await?
        {
            debug!("Verification of {} claimed elsewhere", target.name);
            return Ok(VerificationCheck::NotScheduled);
        }

        let result = self.verify(target, &claimed.remediation_summary).await;
        Ok(VerificationCheck::Completed(
            result,
            VerificationClaim {
                key,
                raw: claimed_raw,
                pending: claimed,
            },
        ))
    }

    /// Delete a claimed record once its result has been reported
    pub async fn finish(&self, claim: VerificationClaim) -> Result<(), StateError> {
        if !self
            .store
            .compare_and_swap(&claim.key, Some(&claim.raw), None)
            .await?
        {
            debug!(
                "Verification record for {} was replaced while reporting",
                claim.pending.target
            );
        }
        Ok(())
    }

    /// Hand a claimed record back so the next check verifies it again
    pub async fn release(&self, claim: VerificationClaim) -> Result<(), StateError> {
        let released = PendingVerification {
            claimed_at: None,
            ..claim.pending
        };
        let released_raw = encode(&claim.key, &released)?;
        if !self
            .store
            .compare_and_swap(&claim.key, Some(&claim.raw), Some(released_raw))
            .await?
        {
            debug!(
                "Verification record for {} was replaced while reporting",
                released.target
            );
        }
        Ok(())
    }
}
