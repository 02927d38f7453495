use crate::config::Target;
use crate::error::ProbeError;
use crate::model::{truncate_text, Observation, ProbeOutcome, MAX_DETAIL_LEN};
use log::debug;
use reqwest::Client;

/// Vantage name recorded on observations made by this process
pub const LOCAL_VANTAGE: &str = "local";

/// Issues lightweight HEAD probes against target endpoints
///
/// One request per call with the target's own timeout. Retry policy belongs
/// to the caller.
#[derive(Debug, Clone)]
pub struct Prober {
    client: Client,
}

impl Prober {
    /// Create a prober with its own HTTP client
    pub fn new() -> Result<Self, ProbeError> {
        let client = Client::builder()
            .user_agent(concat!("sentinel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::ClientBuild(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Create a prober around an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Probe a target once
    ///
    /// Maps a status satisfying the target's success criterion to
    /// `Success`, any other status to `Failure`, and transport faults to
    /// `Error` with a bounded message.
    pub async fn probe(&self, target: &Target) -> Observation {
        let result = self
            .client
            .head(&target.url)
            .timeout(target.probe_timeout)
            .send()
            .await;

        let outcome = match result {
            Ok(response) => {
                let status = response.status().as_u16();
                if target.is_success_status(status) {
                    ProbeOutcome::Success(status)
                } else {
                    ProbeOutcome::Failure(status)
                }
            }
            Err(e) => ProbeOutcome::Error(describe_error(&e, target)),
        };

        debug!("Probe {} ({}): {}", target.name, target.url, outcome.detail());
        Observation::new(&target.name, outcome, LOCAL_VANTAGE)
    }
}

fn describe_error(error: &reqwest::Error, target: &Target) -> String {
    let message = if error.is_timeout() {
        format!("timed out after {}s", target.probe_timeout.as_secs_f64())
    } else if error.is_connect() {
        format!("connection failed: {}", root_cause(error))
    } else {
        root_cause(error)
    };
    truncate_text(&message, MAX_DETAIL_LEN)
}

/// Innermost error message; reqwest's top-level text repeats the URL
fn root_cause(error: &(dyn std::error::Error + 'static)) -> String {
    let mut current = error;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}
