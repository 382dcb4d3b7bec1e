//! Threshold ladders registered with the usage monitor

use screentime_host_api::{Threshold, ThresholdRegistration};
use screentime_util::{AppId, AppToken, EventName};
use std::time::Duration;

/// Cumulative thresholds `step, 2*step, ...` up to and including `ceiling`
pub fn threshold_ladder(step: Duration, ceiling: Duration) -> Vec<u64> {
    let step = step.as_secs();
    let ceiling = ceiling.as_secs();
    if step == 0 {
        return Vec::new();
    }
    (1..=ceiling / step).map(|n| n * step).collect()
}

/// Build the registration of a ladder for one app token
pub fn registration_for(app_id: &AppId, token: &AppToken, ladder: &[u64]) -> ThresholdRegistration {
    ThresholdRegistration {
        app_id: app_id.clone(),
        token: token.clone(),
        thresholds: ladder
            .iter()
            .map(|&secs| Threshold {
                event_name: EventName::for_threshold(app_id, secs),
                cumulative_seconds: secs,
            })
            .collect(),
    }
}
