use crate::config::Target;
use crate::error::{CredentialError, ExecError, RemediationError, StateError};
use crate::model::Timestamp;
use crate::remediation::{Credential, CredentialProvider, RemoteExecutor};
use crate::state::records::new_holder_id;
use crate::state::{decode, encode, in_flight_key, InFlightMarker, StateStore};
use chrono::Utc;
use log::{error, info, warn};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one dispatched remediation
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RemediationRecord {
    pub target: String,
    pub command: String,
    pub started_at: Timestamp,
    pub completed_at: Timestamp,
    pub exit_status: Option<i32>,
    /// Bounded prefix of remote stdout
    pub stdout: String,
    /// Bounded prefix of remote stderr
    pub stderr: String,
    #[serde(serialize_with = "serialize_failure")]
    pub failure: Option<RemediationError>,
}

fn serialize_failure<S: Serializer>(
    failure: &Option<RemediationError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match failure {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl RemediationRecord {
    /// Remote command ran and exited zero; says nothing about service health
    pub fn succeeded(&self) -> bool {
        self.failure.is_none() && self.exit_status == Some(0)
    }

    /// One-line summary used in alerts and verification records
    pub fn summary(&self) -> String {
        match &self.failure {
            None => {
                let output = self.stdout.trim();
                if output.is_empty() {
                    "restart command exited 0".to_string()
                } else {
                    format!("restart command exited 0: {}", output)
                }
            }
            Some(RemediationError::ExecutionFailure {
                exit_status: Some(code),
                stderr,
            }) => format!("restart command failed with exit {}: {}", code, stderr.trim()),
            Some(e) => format!("restart failed: {}", e),
        }
    }
}

/// Releases an in-flight marker; if dropped unreleased (cancelled
/// invocation), clears the marker from a background task
struct InFlightGuard {
    store: Arc<dyn StateStore>,
    key: String,
    marker: Option<String>,
}

impl InFlightGuard {
    async fn release(mut self) -> Result<(), StateError> {
        if let Some(marker) = self.marker.take() {
            let cleared = self
                .store
                .compare_and_swap(&self.key, Some(&marker), None)
                .await?;
            if !cleared {
                warn!("In-flight marker {} was replaced before release", self.key);
            }
        }
        Ok(())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let Some(marker) = self.marker.take() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.compare_and_swap(&key, Some(&marker), None).await {
                        error!("Failed to clear abandoned in-flight marker {}: {}", key, e);
                    }
                });
            }
            Err(_) => warn!(
                "In-flight marker {} left behind; it expires after the staleness window",
                key
            ),
        }
    }
}

/// Executes a target's fixed corrective command over the remote channel
///
/// At most one remediation per target is in flight at a time, enforced by a
/// conditional write of an [`InFlightMarker`] in the state store. Markers
/// older than `max_staleness` are taken over so a crashed invocation cannot
/// block remediation forever.
pub struct RemediationDispatcher {
    store: Arc<dyn StateStore>,
    credentials: Arc<dyn CredentialProvider>,
    executor: Arc<dyn RemoteExecutor>,
    max_staleness: Duration,
}

impl RemediationDispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        credentials: Arc<dyn CredentialProvider>,
        executor: Arc<dyn RemoteExecutor>,
        max_staleness: Duration,
    ) -> Self {
        Self {
            store,
            credentials,
            executor,
            max_staleness,
        }
    }

    /// Remediate a target
    ///
    /// Returns `AlreadyInFlight` or a state-store error without running
    /// anything. Every other failure (credentials, timeout, non-zero exit)
    /// is recorded in the returned record, and the in-flight marker is
    /// cleared in all cases.
    pub async fn remediate(&self, target: &Target) -> Result<RemediationRecord, RemediationError> {
        let spec = target
            .remediation
            .as_ref()
            .ok_or_else(|| RemediationError::NotConfigured(target.name.clone()))?;

        let started_at = Utc::now();
        let guard = self.acquire(&target.name, started_at).await?;
        info!("Remediating {}: {}", target.name, spec.command);

        let mut record = RemediationRecord {
            target: target.name.clone(),
            command: spec.command.clone(),
            started_at,
            completed_at: started_at,
            exit_status: None,
            stdout: String::new(),
            stderr: String::new(),
            failure: None,
        };

        match self.lookup_credential(&spec.credential).await {
            Err(e) => record.failure = Some(RemediationError::Credential(e)),
            Ok(credential) => {
                let exec = self.executor.exec(
                    &credential,
                    &spec.user,
                    &spec.host,
                    &spec.command,
                    target.remediation_timeout,
                );
                match tokio::time::timeout(target.remediation_timeout, exec).await {
                    Ok(Ok(output)) => {
                        record.exit_status = Some(output.exit_status);
                        if output.exit_status != 0 {
                            record.failure = Some(RemediationError::ExecutionFailure {
                                exit_status: Some(output.exit_status),
                                stderr: output.stderr.clone(),
                            });
                        }
                        record.stdout = output.stdout;
                        record.stderr = output.stderr;
                    }
                    Ok(Err(ExecError::Timeout(after))) => {
                        record.failure = Some(RemediationError::ExecutionTimeout(after))
                    }
                    Ok(Err(ExecError::Connection(message))) => {
                        record.stderr = message.clone();
                        record.failure = Some(RemediationError::ExecutionFailure {
                            exit_status: None,
                            stderr: message,
                        });
                    }
                    Err(_) => {
                        record.failure =
                            Some(RemediationError::ExecutionTimeout(target.remediation_timeout))
                    }
                }
            }
        }

        record.completed_at = Utc::now();

        if let Err(e) = guard.release().await {
            error!("Failed to clear in-flight marker for {}: {}", target.name, e);
        }

        match &record.failure {
            None => info!("Remediation of {} finished: {}", target.name, record.summary()),
            Some(_) => warn!("Remediation of {} failed: {}", target.name, record.summary()),
        }

        Ok(record)
    }

    /// Providers may touch the filesystem, so lookups run off the async workers
    async fn lookup_credential(&self, reference: &str) -> Result<Credential, CredentialError> {
        let credentials = Arc::clone(&self.credentials);
        let owned = reference.to_string();
        tokio::task::spawn_blocking(move || credentials.get(&owned))
            .await
            .unwrap_or_else(|e| {
                Err(CredentialError::Unusable {
                    reference: reference.to_string(),
                    message: format!("credential lookup did not complete: {}", e),
                })
            })
    }

    async fn acquire(&self, target: &str, now: Timestamp) -> Result<InFlightGuard, RemediationError> {
        let key = in_flight_key(target);
        let marker = InFlightMarker {
            holder: new_holder_id(),
            acquired_at: now,
        };
        let raw = encode(&key, &marker)?;

        let acquired = if self.store.put_if_absent(&key, raw.clone()).await? {
            true
        } else {
            match self.store.get(&key).await? {
                // Released in between; one more conditional attempt
                None => self.store.put_if_absent(&key, raw.clone()).await?,
                Some(existing_raw) => {
                    let stale = match decode::<InFlightMarker>(&key, &existing_raw) {
                        Ok(existing) => existing.is_stale(now, self.max_staleness),
                        Err(e) => {
                            warn!("Replacing unreadable in-flight marker: {}", e);
                            true
                        }
                    };
                    if stale {
                        warn!("Taking over stale in-flight marker for {}", target);
                        self.store
                            .compare_and_swap(&key, Some(&existing_raw), Some(raw.clone()))
                            .await?
                    } else {
                        false
                    }
                }
            }
        };

        if !acquired {
            info!("Remediation already in flight for {}, skipping", target);
            return Err(RemediationError::AlreadyInFlight(target.to_string()));
        }

        Ok(InFlightGuard {
            store: Arc::clone(&self.store),
            key,
            marker: Some(raw),
        })
    }
}
