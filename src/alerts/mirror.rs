use crate::error::AlertError;
use crate::model::AlarmStatus;
use crate::BoxFuture;
use log::debug;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

/// Alarm-state transition mirrored to the secondary rail
///
/// The target identifier travels as its own field; consumers never need to
/// parse it back out of `alarm_name`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AlarmTransition {
    pub alarm_name: String,
    pub target: String,
    pub state: AlarmStatus,
    pub reason: String,
}

/// Secondary notification rail mirroring state-change messages
pub trait AlarmMirror: Send + Sync {
    fn trigger<'a>(
        &'a self,
        target: &'a str,
        state: AlarmStatus,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<(), AlertError>>;
}

/// Posts each transition as JSON to a fixed URL
#[derive(Debug, Clone)]
pub struct HttpAlarmMirror {
    client: Client,
    url: String,
    alarm_prefix: String,
}

impl HttpAlarmMirror {
    pub fn new(url: impl Into<String>, alarm_prefix: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Delivery(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, url, alarm_prefix))
    }

    pub fn with_client(client: Client, url: impl Into<String>, alarm_prefix: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            alarm_prefix: alarm_prefix.into(),
        }
    }

    /// Display name of a target's alarm, e.g. `sentinel-YC2`
    pub fn alarm_name(&self, target: &str) -> String {
        format!("{}-{}", self.alarm_prefix, target)
    }
}

impl AlarmMirror for HttpAlarmMirror {
    fn trigger<'a>(
        &'a self,
        target: &'a str,
        state: AlarmStatus,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<(), AlertError>> {
        Box::pin(async move {
            debug!("Mirroring {} -> {}", target, state);
            let transition = AlarmTransition {
                alarm_name: self.alarm_name(target),
                target: target.to_string(),
                state,
                reason: reason.to_string(),
            };
            let response = self
                .client
                .post(&self.url)
                .json(&transition)
                .send()
                .await
                .map_err(|e| AlertError::Delivery(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(AlertError::Delivery(format!("HTTP {}", status.as_u16())));
            }
            Ok(())
        })
    }
}
