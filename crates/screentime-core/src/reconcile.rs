//! Snapshot reconciliation
//!
//! Threshold events can be lost. Periodically the host captures today's
//! cumulative usage per app independently, and the reconciler decides how much
//! of the gap between that snapshot and the ledger may be credited. The ledger
//! stays authoritative whenever it is ahead, and counters never go down.

use chrono::{DateTime, Local};
use screentime_api::UsageSnapshot;
use screentime_config::ReconcileSettings;
use screentime_util::{AppId, AppToken, seconds_since_midnight};
use std::collections::HashMap;
use std::fmt;

use crate::validator::{seconds_between, to_secs};

/// Why a snapshot or one of its entries was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Monitoring is stopped
    MonitoringStopped,
    /// Token not mapped to any configured app
    UnknownToken,
    /// Ledger already at or above the reported value
    LedgerAhead,
    /// Same capture already applied for this app
    DuplicateSnapshot,
    /// A threshold event was accepted just before the capture
    RecentEvent,
    /// Captured longer ago than the freshness window
    Stale,
    /// Captured on an earlier day
    PreviousDay,
    /// Captured too far in the future
    FromFuture,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::MonitoringStopped => "monitoring stopped",
            SkipReason::UnknownToken => "unknown token",
            SkipReason::LedgerAhead => "ledger ahead",
            SkipReason::DuplicateSnapshot => "duplicate snapshot",
            SkipReason::RecentEvent => "recent threshold event",
            SkipReason::Stale => "stale snapshot",
            SkipReason::PreviousDay => "snapshot from a previous day",
            SkipReason::FromFuture => "snapshot from the future",
        };
        f.write_str(s)
    }
}

/// Per-token result of a reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied {
        app_id: AppId,
        seconds: u64,
        clamped: bool,
    },
    Skipped {
        token: AppToken,
        app_id: Option<AppId>,
        reason: SkipReason,
    },
}

/// Result of reconciling one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub captured_at: DateTime<Local>,
    /// Set when the whole snapshot was rejected
    pub rejected: Option<SkipReason>,
    pub outcomes: Vec<ReconcileOutcome>,
}

impl ReconcileReport {
    pub fn rejected(captured_at: DateTime<Local>, reason: SkipReason) -> Self {
        Self {
            captured_at,
            rejected: Some(reason),
            outcomes: Vec::new(),
        }
    }

    pub fn applied_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ReconcileOutcome::Applied { .. }))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes.len() - self.applied_count()
    }

    /// Total seconds credited
    pub fn credited_seconds(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| match o {
                ReconcileOutcome::Applied { seconds, .. } => *seconds,
                ReconcileOutcome::Skipped { .. } => 0,
            })
            .sum()
    }
}

/// What the ledger and validator know about an app at capture time
#[derive(Debug, Clone, Copy)]
pub struct AppState {
    pub ledger_today_seconds: u64,
    pub last_credit_at: Option<DateTime<Local>>,
    pub last_event_at: Option<DateTime<Local>>,
}

/// Credit to apply for one app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correction {
    pub seconds: u64,
    pub clamped: bool,
}

/// Decides which snapshot corrections are safe to credit
#[derive(Debug)]
pub struct Reconciler {
    settings: ReconcileSettings,
    applied: HashMap<AppId, (DateTime<Local>, u64)>,
}

impl Reconciler {
    pub fn new(settings: ReconcileSettings) -> Self {
        Self {
            settings,
            applied: HashMap::new(),
        }
    }

    pub fn set_settings(&mut self, settings: ReconcileSettings) {
        self.settings = settings;
    }

    /// Reject a whole snapshot that is stale, from another day or from the future
    pub fn check_snapshot(&self, snapshot: &UsageSnapshot, now: DateTime<Local>) -> Option<SkipReason> {
        let age = seconds_between(snapshot.captured_at, now);
        if -age > to_secs(self.settings.future_skew) {
            return Some(SkipReason::FromFuture);
        }
        if snapshot.captured_at.date_naive() < now.date_naive() {
            return Some(SkipReason::PreviousDay);
        }
        if age > to_secs(self.settings.freshness) {
            return Some(SkipReason::Stale);
        }
        None
    }

    /// Decide the correction for one app's reported value
    pub fn plan(
        &self,
        app_id: &AppId,
        reported: u64,
        captured_at: DateTime<Local>,
        state: AppState,
    ) -> Result<Correction, SkipReason> {
        if let Some((at, value)) = self.applied.get(app_id)
            && *at == captured_at
            && *value == reported
        {
            return Err(SkipReason::DuplicateSnapshot);
        }

        if reported <= state.ledger_today_seconds {
            return Err(SkipReason::LedgerAhead);
        }

        if let Some(event_at) = state.last_event_at
            && seconds_between(event_at, captured_at).abs()
                <= to_secs(self.settings.recent_event_window)
        {
            return Err(SkipReason::RecentEvent);
        }

        let elapsed = match state.last_credit_at {
            Some(credit_at) if credit_at.date_naive() == captured_at.date_naive() => {
                u64::try_from(seconds_between(credit_at, captured_at)).unwrap_or(0)
            }
            _ => seconds_since_midnight(&captured_at),
        };
        let allowed = elapsed.saturating_add(self.settings.slack.as_secs());
        let gap = reported - state.ledger_today_seconds;

        Ok(Correction {
            seconds: gap.min(allowed),
            clamped: gap > allowed,
        })
    }

    /// Remember an applied capture so it is never credited twice
    pub fn mark_applied(&mut self, app_id: &AppId, captured_at: DateTime<Local>, reported: u64) {
        self.applied.insert(app_id.clone(), (captured_at, reported));
    }

    /// Forget captures from before `now`'s day
    pub fn prune(&mut self, now: DateTime<Local>) {
        let today = now.date_naive();
        self.applied.retain(|_, (at, _)| at.date_naive() == today);
    }
}
