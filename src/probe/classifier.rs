use crate::model::{HealthVerdict, Observation, Verdict};

/// Classify a target from its observations for one cycle
///
/// Healthy iff successes strictly exceed half of the observations; an empty
/// list is Indeterminate. A single observation degrades to pass/fail.
pub fn classify(target: &str, observations: &[Observation]) -> HealthVerdict {
    let total = observations.len();
    let successes = observations
        .iter()
        .filter(|o| o.outcome.is_success())
        .count();

    let verdict = if total == 0 {
        Verdict::Indeterminate
    } else if successes * 2 > total {
        Verdict::Healthy
    } else {
        Verdict::Unhealthy
    };

    let detail = match observations {
        [] => "no observations".to_string(),
        [single] => single.outcome.detail(),
        _ => format!("{}/{} vantage points successful", successes, total),
    };

    HealthVerdict {
        target: target.to_string(),
        verdict,
        successes,
        total,
        detail,
    }
}
