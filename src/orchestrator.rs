//! Per-invocation control flow
//!
//! One cycle runs, for every target concurrently (bounded by
//! `max_concurrency`, all inside the invocation budget):
//!
//! 1. If a recovery verification is due, run it instead of a fresh probe;
//!    `Confirmed` leaves ALARM, `StillFailing` stays in it.
//! 2. If a verification is scheduled but not due, hold ALARM without
//!    probing or remediating.
//! 3. Otherwise observe and classify. Unhealthy and Indeterminate targets
//!    enter ALARM and, when remediation is enabled and configured, are
//!    remediated and scheduled for verification.
//! 4. Hand the computed state to the alert router, which persists it only
//!    after delivery.
//!
//! A failure in one target never stops the others; everything that happened
//! is collected into a [`CycleReport`].

use crate::alerts::{AlertContext, AlertRouter, DigestReceipt, NotifyOutcome};
use crate::config::Target;
use crate::error::RemediationError;
use crate::model::{AlarmStatus, HealthVerdict, Timestamp, Verdict};
use crate::probe::{classify, ObservationSource};
use crate::recovery::{RecoveryOutcome, RecoveryVerifier, VerificationCheck, VerificationClaim, VerificationResult};
use crate::remediation::{RemediationDispatcher, RemediationRecord};
use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const HOLD_REASON: &str = "awaiting recovery verification";

/// Everything one cycle did for one target
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TargetReport {
    pub target: String,
    /// State computed this cycle; absent if the target did not finish
    pub status: Option<AlarmStatus>,
    pub verdict: Option<HealthVerdict>,
    pub remediation: Option<RemediationRecord>,
    /// Remediation was needed but another invocation holds the lock
    pub remediation_in_flight: bool,
    pub verification: Option<VerificationResult>,
    /// When the scheduled recovery verification becomes due
    pub verification_due_at: Option<Timestamp>,
    pub notification: Option<NotifyOutcome>,
    pub errors: Vec<String>,
    /// Cut off by the invocation budget
    pub timed_out: bool,
}

impl TargetReport {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            ..Self::default()
        }
    }

    fn timed_out(target: &str) -> Self {
        Self {
            timed_out: true,
            errors: vec!["did not finish within the invocation budget".to_string()],
            ..Self::new(target)
        }
    }
}

/// Aggregate result of one monitoring cycle
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CycleReport {
    pub started_at: Timestamp,
    pub completed_at: Timestamp,
    pub targets: Vec<TargetReport>,
}

impl CycleReport {
    pub fn alarms(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.status == Some(AlarmStatus::Alarm))
            .count()
    }

    pub fn target(&self, name: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.target == name)
    }
}

/// Result of the periodic digest flow
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DigestReport {
    pub verdicts: Vec<HealthVerdict>,
    pub receipt: Option<DigestReceipt>,
    pub error: Option<String>,
}

/// Outcome of the OK heartbeat for one target
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HeartbeatReport {
    pub target: String,
    pub verdict: Verdict,
    pub sent: bool,
    pub error: Option<String>,
}

/// Shared stages, cloned cheaply into each per-target task
#[derive(Clone)]
struct Pipeline {
    source: Arc<dyn ObservationSource>,
    dispatcher: Option<Arc<RemediationDispatcher>>,
    verifier: Option<Arc<RecoveryVerifier>>,
    router: Arc<AlertRouter>,
}

pub struct Orchestrator {
    targets: Vec<Target>,
    pipeline: Pipeline,
    max_concurrency: usize,
    invocation_budget: Duration,
}

impl Orchestrator {
    /// Orchestrator with probing and alerting only; remediation and
    /// verification stages are added with the builder methods
    pub fn new(targets: Vec<Target>, source: Arc<dyn ObservationSource>, router: Arc<AlertRouter>) -> Self {
        Self {
            targets,
            pipeline: Pipeline {
                source,
                dispatcher: None,
                verifier: None,
                router,
            },
            max_concurrency: 8,
            invocation_budget: Duration::from_secs(240),
        }
    }

    pub fn with_remediation(mut self, dispatcher: Arc<RemediationDispatcher>) -> Self {
        self.pipeline.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_verification(mut self, verifier: Arc<RecoveryVerifier>) -> Self {
        self.pipeline.verifier = Some(verifier);
        self
    }

    pub fn with_limits(mut self, max_concurrency: usize, invocation_budget: Duration) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self.invocation_budget = invocation_budget;
        self
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Run one monitoring cycle now
    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one monitoring cycle with an explicit clock
    pub async fn run_cycle_at(&self, now: Timestamp) -> CycleReport {
        info!("Starting cycle over {} targets", self.targets.len());
        let results = self
            .fan_out(move |pipeline, target| async move { pipeline.check(&target, now).await })
            .await;

        let targets = results
            .into_iter()
            .map(|(name, report)| report.unwrap_or_else(|| TargetReport::timed_out(&name)))
            .collect();
        let report = CycleReport {
            started_at: now,
            completed_at: Utc::now(),
            targets,
        };
        info!("Cycle finished: {} in ALARM", report.alarms());
        report
    }

    /// Run only the verifications whose cool-down has elapsed
    ///
    /// Targets without a due verification are left out of the report.
    pub async fn run_due_verifications_at(&self, now: Timestamp) -> CycleReport {
        let results = self
            .fan_out(move |pipeline, target| async move {
                pipeline.verify_due(&target, now).await
            })
            .await;

        let targets = results
            .into_iter()
            .filter_map(|(name, report)| match report {
                Some(report) => report,
                None => Some(TargetReport::timed_out(&name)),
            })
            .collect();
        CycleReport {
            started_at: now,
            completed_at: Utc::now(),
            targets,
        }
    }

    /// Probe every target and post one digest message
    pub async fn run_digest_at(&self, now: Timestamp) -> DigestReport {
        let verdicts = self.observe_all().await;
        match self.pipeline.router.post_digest(&verdicts, now).await {
            Ok(receipt) => DigestReport {
                verdicts,
                receipt: Some(receipt),
                error: None,
            },
            Err(e) => {
                error!("Failed to post digest: {}", e);
                DigestReport {
                    verdicts,
                    receipt: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Probe every target and send the OK heartbeat for the healthy ones
    pub async fn run_heartbeat(&self) -> Vec<HeartbeatReport> {
        let results = self
            .fan_out(|pipeline, target| async move {
                let verdict = pipeline.observe(&target).await;
                let mut report = HeartbeatReport {
                    target: target.name.clone(),
                    verdict: verdict.verdict,
                    sent: false,
                    error: None,
                };
                if verdict.verdict.is_healthy() {
                    match pipeline.router.send_heartbeat(&target).await {
                        Ok(()) => report.sent = true,
                        Err(e) => {
                            warn!("Heartbeat for {} failed: {}", target.name, e);
                            report.error = Some(e.to_string());
                        }
                    }
                }
                report
            })
            .await;

        results
            .into_iter()
            .map(|(name, report)| {
                report.unwrap_or(HeartbeatReport {
                    target: name,
                    verdict: Verdict::Indeterminate,
                    sent: false,
                    error: Some("did not finish within the invocation budget".to_string()),
                })
            })
            .collect()
    }

    async fn observe_all(&self) -> Vec<HealthVerdict> {
        self.fan_out(|pipeline, target| async move { pipeline.observe(&target).await })
            .await
            .into_iter()
            .map(|(name, verdict)| {
                verdict.unwrap_or(HealthVerdict {
                    target: name,
                    verdict: Verdict::Indeterminate,
                    successes: 0,
                    total: 0,
                    detail: "probe did not finish within the invocation budget".to_string(),
                })
            })
            .collect()
    }

    /// Run `work` once per target, bounded by the concurrency limit and the
    /// invocation budget; results keep configuration order, `None` for
    /// targets cut off by the budget
    async fn fan_out<T, F, Fut>(&self, work: F) -> Vec<(String, Option<T>)>
    where
        F: Fn(Pipeline, Target) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        for (index, target) in self.targets.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let task = work(self.pipeline.clone(), target.clone());
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (index, task.await)
            });
        }

        let mut results: Vec<Option<T>> = self.targets.iter().map(|_| None).collect();
        let collect = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, value)) => results[index] = Some(value),
                    Err(e) => error!("Target task failed: {}", e),
                }
            }
        };

        if tokio::time::timeout(self.invocation_budget, collect).await.is_err() {
            warn!(
                "Invocation budget of {:?} exhausted; cancelling unfinished targets",
                self.invocation_budget
            );
            tasks.abort_all();
            // Let cancelled tasks run their cleanup before reporting
            while tasks.join_next().await.is_some() {}
        }

        self.targets
            .iter()
            .map(|t| t.name.clone())
            .zip(results)
            .collect()
    }
}

impl Pipeline {
    async fn observe(&self, target: &Target) -> HealthVerdict {
        let observations = self.source.observe(target).await;
        classify(&target.name, &observations)
    }

    async fn check(&self, target: &Target, now: Timestamp) -> TargetReport {
        let mut report = TargetReport::new(&target.name);

        if let Some(verifier) = &self.verifier {
            match verifier.verify_if_due(target, now).await {
                Ok(VerificationCheck::Completed(result, claim)) => {
                    self.report_verification(verifier, target, result, claim, now, &mut report)
                        .await;
                    return report;
                }
                Ok(VerificationCheck::NotDue(pending)) => {
                    info!("{} awaiting verification until {}", target.name, pending.due_at);
                    report.verification_due_at = Some(pending.due_at);
                    report.status = Some(AlarmStatus::Alarm);
                    // Resends the remediation alert only if it never got through
                    let reason = if pending.reason.is_empty() {
                        HOLD_REASON.to_string()
                    } else {
                        pending.reason
                    };
                    let context = AlertContext {
                        remediation: Some(pending.remediation_summary),
                        redelivery: true,
                        ..AlertContext::default()
                    };
                    self.notify(target, AlarmStatus::Alarm, &reason, context, now, &mut report)
                        .await;
                    return report;
                }
                Ok(VerificationCheck::NotScheduled) => {}
                Err(e) => {
                    error!("Failed to read verification state for {}: {}", target.name, e);
                    report.errors.push(e.to_string());
                }
            }
        }

        let verdict = self.observe(target).await;
        let status = AlarmStatus::from_verdict(verdict.verdict);
        info!("{}: {} ({})", target.name, verdict.verdict, verdict.detail);

        let mut context = AlertContext::default();
        if verdict.verdict.needs_remediation() && target.remediation.is_some() {
            if let Some(dispatcher) = &self.dispatcher {
                match dispatcher.remediate(target).await {
                    Ok(record) => {
                        let summary = record.summary();
                        if let Some(verifier) = &self.verifier {
                            match verifier
                                .schedule(target, target.cooldown, &summary, &verdict.detail, now)
                                .await
                            {
                                Ok(pending) => report.verification_due_at = Some(pending.due_at),
                                Err(e) => {
                                    error!("Failed to schedule verification for {}: {}", target.name, e);
                                    report.errors.push(e.to_string());
                                }
                            }
                        }
                        if let Some(failure) = &record.failure {
                            report.errors.push(failure.to_string());
                        }
                        context.remediation = Some(summary);
                        report.remediation = Some(record);
                    }
                    Err(RemediationError::AlreadyInFlight(_)) => report.remediation_in_flight = true,
                    Err(e) => {
                        error!("Remediation of {} not started: {}", target.name, e);
                        report.errors.push(e.to_string());
                    }
                }
            }
        }

        report.status = Some(status);
        let reason = verdict.detail.clone();
        report.verdict = Some(verdict);
        self.notify(target, status, &reason, context, now, &mut report).await;
        report
    }

    /// Verification sweep for one target; `None` when nothing was due
    async fn verify_due(&self, target: &Target, now: Timestamp) -> Option<TargetReport> {
        let verifier = self.verifier.as_ref()?;
        let mut report = TargetReport::new(&target.name);
        match verifier.verify_if_due(target, now).await {
            Ok(VerificationCheck::Completed(result, claim)) => {
                self.report_verification(verifier, target, result, claim, now, &mut report)
                    .await;
                Some(report)
            }
            Ok(_) => None,
            Err(e) => {
                error!("Failed to read verification state for {}: {}", target.name, e);
                report.errors.push(e.to_string());
                Some(report)
            }
        }
    }

    /// Report a completed verification; its record is dropped once the
    /// alert went through and handed back for another attempt otherwise
    async fn report_verification(
        &self,
        verifier: &RecoveryVerifier,
        target: &Target,
        result: VerificationResult,
        claim: VerificationClaim,
        now: Timestamp,
        report: &mut TargetReport,
    ) {
        let status = match result.outcome {
            RecoveryOutcome::Confirmed => AlarmStatus::Ok,
            RecoveryOutcome::StillFailing => AlarmStatus::Alarm,
        };
        let context = AlertContext {
            remediation: Some(result.remediation_summary.clone()),
            verification: Some(result.summary()),
            redelivery: true,
        };
        let reason = result.verdict.detail.clone();

        report.status = Some(status);
        report.verdict = Some(result.verdict.clone());
        report.verification = Some(result);
        let settled = if self.notify(target, status, &reason, context, now, report).await {
            verifier.finish(claim).await
        } else {
            verifier.release(claim).await
        };
        if let Err(e) = settled {
            error!("Failed to update verification state for {}: {}", target.name, e);
            report.errors.push(e.to_string());
        }
    }

    async fn notify(
        &self,
        target: &Target,
        status: AlarmStatus,
        reason: &str,
        context: AlertContext,
        now: Timestamp,
        report: &mut TargetReport,
    ) -> bool {
        match self.router.notify(target, status, reason, &context, now).await {
            Ok(outcome) => {
                report.notification = Some(outcome);
                true
            }
            Err(e) => {
                if e.is_transient() {
                    warn!("Alert for {} not delivered, will retry next cycle: {}", target.name, e);
                } else {
                    error!("Alert for {} cannot be delivered: {}", target.name, e);
                }
                report.errors.push(e.to_string());
                false
            }
        }
    }
}
