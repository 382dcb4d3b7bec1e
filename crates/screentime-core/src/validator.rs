//! Threshold event filtering
//!
//! The monitor delivers "threshold crossed" events at least once, replays
//! historical thresholds in bursts when monitoring restarts, and sometimes
//! fires the same threshold repeatedly. Every event passes through
//! [`EventValidator::validate`] before it can touch the ledger. Rejections
//! err on the side of under-counting.

use chrono::{DateTime, Local, NaiveDate};
use screentime_api::UsageEvent;
use screentime_config::ValidatorSettings;
use screentime_util::{AppToken, EventName};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Why an event was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Monitoring is stopped
    MonitoringStopped,
    /// Fired during the start-up grace period
    GracePeriod,
    /// Same app accepted an event within the dedup window
    Duplicate,
    /// Same threshold fired again within the monitor's minimum increment
    Cascade,
    /// Watermark not above the last accepted watermark for today
    Replay,
}

/// Outcome of validating one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Stateful filter in front of the ledger
#[derive(Debug)]
pub struct EventValidator {
    settings: ValidatorSettings,
    monitoring_started_at: Option<DateTime<Local>>,
    last_accepted: HashMap<AppToken, DateTime<Local>>,
    last_fire: HashMap<(EventName, AppToken), DateTime<Local>>,
    watermarks: HashMap<AppToken, (NaiveDate, u64)>,
}

impl EventValidator {
    pub fn new(settings: ValidatorSettings) -> Self {
        Self {
            settings,
            monitoring_started_at: None,
            last_accepted: HashMap::new(),
            last_fire: HashMap::new(),
            watermarks: HashMap::new(),
        }
    }

    pub fn set_settings(&mut self, settings: ValidatorSettings) {
        self.settings = settings;
    }

    /// Begin accepting events; the grace period starts now
    pub fn start(&mut self, now: DateTime<Local>) {
        self.monitoring_started_at = Some(now);
    }

    /// Reject every event until the next `start`
    pub fn stop(&mut self) {
        self.monitoring_started_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.monitoring_started_at.is_some()
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.monitoring_started_at
    }

    /// Decide whether an event should be applied, recording it if so
    pub fn validate(&mut self, event: &UsageEvent) -> Verdict {
        let verdict = self.check(event);
        match verdict {
            Verdict::Accepted => {
                self.last_accepted
                    .insert(event.app_token.clone(), event.fired_at);
                self.watermarks.insert(
                    event.app_token.clone(),
                    (event.fired_at.date_naive(), event.cumulative_threshold_seconds),
                );
            }
            Verdict::Rejected(reason) => {
                debug!(
                    token = %event.app_token,
                    event = %event.event_name,
                    threshold_secs = event.cumulative_threshold_seconds,
                    reason = ?reason,
                    "Threshold event rejected"
                );
            }
        }
        verdict
    }

    fn check(&mut self, event: &UsageEvent) -> Verdict {
        let Some(started_at) = self.monitoring_started_at else {
            return Verdict::Rejected(RejectReason::MonitoringStopped);
        };

        // Every fire is tracked, accepted or not, so a burst stays suppressed
        let previous_fire = self.last_fire.insert(
            (event.event_name.clone(), event.app_token.clone()),
            event.fired_at,
        );

        if seconds_between(started_at, event.fired_at) < to_secs(self.settings.grace_period) {
            return Verdict::Rejected(RejectReason::GracePeriod);
        }

        if let Some(last) = self.last_accepted.get(&event.app_token)
            && seconds_between(*last, event.fired_at).abs() < to_secs(self.settings.dedup_window)
        {
            return Verdict::Rejected(RejectReason::Duplicate);
        }

        if let Some(previous) = previous_fire
            && seconds_between(previous, event.fired_at).abs()
                < to_secs(self.settings.min_increment)
        {
            return Verdict::Rejected(RejectReason::Cascade);
        }

        if let Some((day, watermark)) = self.watermarks.get(&event.app_token)
            && *day == event.fired_at.date_naive()
            && event.cumulative_threshold_seconds <= *watermark
        {
            return Verdict::Rejected(RejectReason::Replay);
        }

        Verdict::Accepted
    }

    /// When an event for this token was last accepted
    pub fn last_accepted(&self, token: &AppToken) -> Option<DateTime<Local>> {
        self.last_accepted.get(token).copied()
    }

    /// Drop tracking entries older than `prune_after`
    pub fn prune(&mut self, now: DateTime<Local>) {
        let horizon = to_secs(self.settings.prune_after);
        let before = self.last_accepted.len() + self.last_fire.len();

        self.last_accepted
            .retain(|_, at| seconds_between(*at, now) <= horizon);
        self.last_fire
            .retain(|_, at| seconds_between(*at, now) <= horizon);
        let today = now.date_naive();
        self.watermarks.retain(|_, (day, _)| *day == today);

        let removed = before - (self.last_accepted.len() + self.last_fire.len());
        if removed > 0 {
            debug!(removed, "Pruned validator entries");
        }
    }
}

/// Signed seconds from `from` to `to`
pub(crate) fn seconds_between(from: DateTime<Local>, to: DateTime<Local>) -> i64 {
    (to - from).num_seconds()
}

pub(crate) fn to_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use screentime_util::AppId;

    fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 12, 29, 15, 0, 0).unwrap()
    }

    fn event(token: &str, secs: u64, at: DateTime<Local>) -> UsageEvent {
        UsageEvent {
            event_name: EventName::for_threshold(&AppId::new(token), secs),
            app_token: AppToken::new(token),
            cumulative_threshold_seconds: secs,
            fired_at: at,
        }
    }

    fn running() -> EventValidator {
        let mut v = EventValidator::new(ValidatorSettings::default());
        v.start(t0());
        v
    }

    #[test]
    fn rejects_everything_when_stopped() {
        let mut v = EventValidator::new(ValidatorSettings::default());
        let verdict = v.validate(&event("a", 60, t0() + ChronoDuration::minutes(5)));
        assert_eq!(verdict, Verdict::Rejected(RejectReason::MonitoringStopped));

        let mut v = running();
        v.stop();
        let verdict = v.validate(&event("a", 60, t0() + ChronoDuration::minutes(5)));
        assert_eq!(verdict, Verdict::Rejected(RejectReason::MonitoringStopped));
    }

    #[test]
    fn cascade_within_grace_period_is_ignored() {
        let mut v = running();
        for i in 1..=60u64 {
            let at = t0() + ChronoDuration::milliseconds(i as i64 * 100);
            assert_eq!(
                v.validate(&event("a", i * 60, at)),
                Verdict::Rejected(RejectReason::GracePeriod)
            );
        }
        assert!(v.last_accepted(&AppToken::new("a")).is_none());
    }

    #[test]
    fn duplicate_replays_accepted_once() {
        let mut v = running();
        let at = t0() + ChronoDuration::minutes(2);
        let e = event("a", 60, at);

        assert!(v.validate(&e).is_accepted());
        for _ in 0..5 {
            assert!(!v.validate(&e).is_accepted());
        }
    }

    #[test]
    fn dedup_window_per_token() {
        let mut v = running();
        let at = t0() + ChronoDuration::minutes(2);

        assert!(v.validate(&event("a", 60, at)).is_accepted());
        // Different token is independent
        assert!(v.validate(&event("b", 60, at)).is_accepted());
        // Same token refires 30s later
        assert_eq!(
            v.validate(&event("a", 60, at + ChronoDuration::seconds(30))),
            Verdict::Rejected(RejectReason::Duplicate)
        );
        // Next rung a minute later
        assert!(v.validate(&event("a", 120, at + ChronoDuration::seconds(60))).is_accepted());
    }

    #[test]
    fn same_threshold_refire_is_cascade() {
        let mut v = running();
        let at = t0() + ChronoDuration::minutes(2);
        let e = event("a", 60, at);

        // First fire lands in the grace period of a second start
        v.start(at);
        assert!(!v.validate(&e).is_accepted());

        // Same pair fires again just after the grace period
        let refire = UsageEvent {
            fired_at: at + ChronoDuration::seconds(31),
            ..e
        };
        assert_eq!(
            v.validate(&refire),
            Verdict::Rejected(RejectReason::Cascade)
        );
    }

    #[test]
    fn lower_watermark_is_replay() {
        let mut v = running();
        let at = t0() + ChronoDuration::minutes(2);

        assert!(v.validate(&event("a", 300, at)).is_accepted());
        assert_eq!(
            v.validate(&event("a", 240, at + ChronoDuration::minutes(2))),
            Verdict::Rejected(RejectReason::Replay)
        );
        assert!(v.validate(&event("a", 360, at + ChronoDuration::minutes(3))).is_accepted());
    }

    #[test]
    fn prune_drops_old_entries() {
        let mut v = running();
        let at = t0() + ChronoDuration::minutes(2);
        assert!(v.validate(&event("a", 60, at)).is_accepted());

        v.prune(at + ChronoDuration::minutes(30));
        assert!(v.last_accepted(&AppToken::new("a")).is_some());

        v.prune(at + ChronoDuration::minutes(61));
        assert!(v.last_accepted(&AppToken::new("a")).is_none());
    }
}
