//! Watch mode: drive cycles, digests, heartbeats and verification sweeps on
//! their own cadences until shutdown is signalled

use crate::config::Config;
use crate::model::{jst, Timestamp};
use crate::orchestrator::Orchestrator;
use chrono::{Days, NaiveTime, TimeZone, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};

/// Cadences for watch mode
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub check_interval: Duration,
    /// Digest times of day in JST
    pub digest_times: Vec<NaiveTime>,
    pub heartbeat_interval: Option<Duration>,
    pub verification_sweep: Option<Duration>,
}

impl Schedule {
    /// Cadences from configuration; disabled stages get no timer
    pub fn from_config(config: &Config) -> Self {
        let heartbeat_interval = if config.stages.ok_heartbeat {
            config
                .schedule
                .heartbeat_interval_seconds
                .map(Duration::from_secs)
                .or(Some(Duration::from_secs(config.schedule.check_interval_seconds)))
        } else {
            None
        };
        let verification_sweep = (config.stages.verification && config.stages.remediation)
            .then(|| Duration::from_secs(config.schedule.verification_sweep_seconds));

        Self {
            check_interval: Duration::from_secs(config.schedule.check_interval_seconds),
            digest_times: config.digest_times.clone(),
            heartbeat_interval,
            verification_sweep,
        }
    }
}

/// The first configured digest time strictly after `now`
pub fn next_digest_after(now: Timestamp, times: &[NaiveTime]) -> Option<Timestamp> {
    let zone = jst();
    let today = now.with_timezone(&zone).date_naive();

    [today, today.checked_add_days(Days::new(1))?]
        .into_iter()
        .flat_map(|day| times.iter().map(move |time| day.and_time(*time)))
        .filter_map(|local| zone.from_local_datetime(&local).single())
        .map(|at| at.with_timezone(&Utc))
        .filter(|at| *at > now)
        .min()
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn tick_optional(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn digest_deadline(times: &[NaiveTime]) -> Option<Instant> {
    let now = Utc::now();
    let next = next_digest_after(now, times)?;
    let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
    debug!("Next digest at {}", next);
    Some(Instant::now() + wait)
}

async fn sleep_until_optional(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Run until `shutdown` becomes `true` or its sender is dropped
///
/// Each job runs to completion before the next timer is serviced, so jobs
/// never overlap within this process.
pub async fn run(orchestrator: Arc<Orchestrator>, schedule: Schedule, mut shutdown: watch::Receiver<bool>) {
    info!(
        "Watching {} targets: checks every {:?}, {} digest times",
        orchestrator.targets().len(),
        schedule.check_interval,
        schedule.digest_times.len()
    );

    let mut checks = ticker(schedule.check_interval);
    let mut heartbeats = schedule.heartbeat_interval.map(ticker);
    let mut sweeps = schedule.verification_sweep.map(ticker);
    let mut next_digest = digest_deadline(&schedule.digest_times);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Shutdown requested, leaving watch loop");
                    break;
                }
            }
            _ = checks.tick() => {
                let report = orchestrator.run_cycle().await;
                let failed = report.targets.iter().filter(|t| !t.errors.is_empty()).count();
                if failed > 0 {
                    warn!("Cycle finished with errors for {} targets", failed);
                }
            }
            _ = tick_optional(&mut sweeps) => {
                let report = orchestrator.run_due_verifications_at(Utc::now()).await;
                if !report.targets.is_empty() {
                    info!("Verified {} targets", report.targets.len());
                }
            }
            _ = tick_optional(&mut heartbeats) => {
                let reports = orchestrator.run_heartbeat().await;
                debug!("Heartbeat sent for {} targets", reports.iter().filter(|r| r.sent).count());
            }
            _ = sleep_until_optional(next_digest) => {
                let report = orchestrator.run_digest_at(Utc::now()).await;
                if let Some(e) = report.error {
                    warn!("Digest not delivered: {}", e);
                }
                next_digest = digest_deadline(&schedule.digest_times);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertRouter;
    use crate::config::{Channel, ChannelEndpoint, Target};
    use crate::model::ProbeOutcome;
    use crate::state::MemoryStateStore;
    use crate::testing::{RecordingBackend, ScriptedSource};
    use std::collections::BTreeMap;

    fn times() -> Vec<NaiveTime> {
        vec![
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        ]
    }

    #[test]
    fn test_next_digest_same_day() {
        // 08:00 JST
        let now = Utc.with_ymd_and_hms(2026, 10, 13, 23, 0, 0).unwrap();
        assert_eq!(
            next_digest_after(now, &times()),
            Some(Utc.with_ymd_and_hms(2026, 10, 14, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_next_digest_later_today() {
        // 09:00 JST exactly: the next one is 18:00
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 0, 0, 0).unwrap();
        assert_eq!(
            next_digest_after(now, &times()),
            Some(Utc.with_ymd_and_hms(2026, 10, 14, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_next_digest_rolls_to_tomorrow() {
        // 20:00 JST
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 11, 0, 0).unwrap();
        assert_eq!(
            next_digest_after(now, &times()),
            Some(Utc.with_ymd_and_hms(2026, 10, 15, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_no_digest_times() {
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 11, 0, 0).unwrap();
        assert_eq!(next_digest_after(now, &[]), None);
    }

    #[tokio::test]
    async fn test_run_checks_until_shutdown() {
        let store = Arc::new(MemoryStateStore::new());
        let backend = Arc::new(RecordingBackend::new());
        let source = Arc::new(ScriptedSource::new());
        source.always("YC2", vec![ProbeOutcome::Success(200)]);
        let mut channels = BTreeMap::new();
        channels.insert(
            "ops".to_string(),
            Channel {
                name: "ops".to_string(),
                endpoint: ChannelEndpoint::Api {
                    channel_id: "C0OPS".to_string(),
                },
            },
        );
        let router = AlertRouter::new(store, backend.clone(), channels, Some("ops".to_string()));
        let orchestrator = Arc::new(Orchestrator::new(
            vec![Target::probe_only("YC2", "https://example.com")],
            source.clone(),
            Arc::new(router),
        ));
        let schedule = Schedule {
            check_interval: Duration::from_millis(20),
            digest_times: Vec::new(),
            heartbeat_interval: None,
            verification_sweep: Some(Duration::from_millis(10)),
        };

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(orchestrator, schedule, rx));
        tokio::time::sleep(Duration::from_millis(110)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(source.calls("YC2") >= 2);
        assert!(backend.posts().is_empty());
    }
}
