//! Blocking decisions and the reasons shown to the user

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use screentime_util::{AppId, format_minutes};
use std::collections::BTreeSet;
use std::fmt;

use crate::DayWindow;

/// Why an app is blocked. Declaration order is priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonKind {
    Downtime,
    DailyLimitReached,
    LearningGoalNotMet,
    RewardBalanceExhausted,
}

impl fmt::Display for ReasonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReasonKind::Downtime => "downtime",
            ReasonKind::DailyLimitReached => "daily_limit_reached",
            ReasonKind::LearningGoalNotMet => "learning_goal_not_met",
            ReasonKind::RewardBalanceExhausted => "reward_balance_exhausted",
        };
        f.write_str(s)
    }
}

/// Context for a downtime block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DowntimeContext {
    pub day_name: String,
    pub allowed: DayWindow,
    /// Human-readable summary of the whole week's windows
    pub week_summary: String,
}

/// Context for a daily limit block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyLimitContext {
    pub limit_minutes: u32,
    pub used_minutes: u32,
}

/// Learning goal progress for a reward app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GoalProgress {
    pub is_goal_met: bool,
    pub target_minutes: u32,
    /// Progress toward the target, capped per app at its requirement
    pub current_minutes: u32,
    pub reward_minutes_earned: u32,
}

impl GoalProgress {
    /// No linked learning apps: nothing to gate on
    pub fn no_goal() -> Self {
        Self {
            is_goal_met: true,
            ..Default::default()
        }
    }
}

/// Shared reward-minute pool at decision time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RewardBalance {
    pub banked_minutes: i64,
    pub earned_today_minutes: i64,
    pub used_today_minutes: i64,
}

impl RewardBalance {
    pub fn available_minutes(&self) -> i64 {
        self.banked_minutes + self.earned_today_minutes - self.used_today_minutes
    }

    pub fn is_exhausted(&self) -> bool {
        self.available_minutes() <= 0
    }
}

/// Outcome of evaluating one app against its schedule and the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingDecision {
    /// None when the app could not be resolved to a logical identity
    pub app_id: Option<AppId>,
    pub should_block: bool,
    pub primary_reason: Option<ReasonKind>,
    pub active_reasons: BTreeSet<ReasonKind>,
    pub downtime: Option<DowntimeContext>,
    pub daily_limit: Option<DailyLimitContext>,
    pub goal: Option<GoalProgress>,
    pub reward_balance: Option<RewardBalance>,
    pub decided_at: DateTime<Local>,
}

impl BlockingDecision {
    /// A decision with no active reasons
    pub fn allowed(app_id: Option<AppId>, decided_at: DateTime<Local>) -> Self {
        Self {
            app_id,
            should_block: false,
            primary_reason: None,
            active_reasons: BTreeSet::new(),
            downtime: None,
            daily_limit: None,
            goal: None,
            reward_balance: None,
            decided_at,
        }
    }

    /// Mark a reason active, keeping the highest-priority one as primary
    pub fn activate(&mut self, reason: ReasonKind) {
        self.active_reasons.insert(reason);
        self.primary_reason = self.active_reasons.iter().next().copied();
        self.should_block = true;
    }

    pub fn is_active(&self, reason: ReasonKind) -> bool {
        self.active_reasons.contains(&reason)
    }

    pub fn can_unlock(&self) -> bool {
        !self.should_block
    }

    /// Render the primary reason for display
    pub fn message(&self) -> Option<String> {
        let reason = self.primary_reason?;
        let text = match reason {
            ReasonKind::Downtime => match &self.downtime {
                Some(ctx) => format!("Downtime: allowed {} on {}", ctx.allowed, ctx.day_name),
                None => "Downtime".to_string(),
            },
            ReasonKind::DailyLimitReached => match &self.daily_limit {
                Some(ctx) => format!(
                    "Daily limit reached: {} of {} used today",
                    format_minutes(ctx.used_minutes),
                    format_minutes(ctx.limit_minutes)
                ),
                None => "Daily limit reached".to_string(),
            },
            ReasonKind::LearningGoalNotMet => match &self.goal {
                Some(goal) => format!(
                    "Learning goal not met: {} of {} minutes done",
                    goal.current_minutes, goal.target_minutes
                ),
                None => "Learning goal not met".to_string(),
            },
            ReasonKind::RewardBalanceExhausted => "No reward minutes left today".to_string(),
        };
        Some(text)
    }

    /// Persistable reason for a blocked app
    pub fn to_block_reason(&self) -> Option<BlockReason> {
        let kind = self.primary_reason?;
        let detail = match kind {
            ReasonKind::Downtime => self.downtime.as_ref().map(|d| d.week_summary.clone()),
            ReasonKind::RewardBalanceExhausted => self
                .reward_balance
                .map(|b| format!("{} reward minutes available", b.available_minutes())),
            _ => None,
        };

        Some(BlockReason {
            kind,
            message: self.message().unwrap_or_default(),
            detail,
            active_reasons: self.active_reasons.iter().copied().collect(),
            daily_limit: self.daily_limit,
            goal: self.goal,
            decided_at: self.decided_at,
        })
    }
}

/// Reason object persisted per blocked app for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockReason {
    pub kind: ReasonKind,
    pub message: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub active_reasons: Vec<ReasonKind>,
    #[serde(default)]
    pub daily_limit: Option<DailyLimitContext>,
    #[serde(default)]
    pub goal: Option<GoalProgress>,
    pub decided_at: DateTime<Local>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 12, 29, 21, 0, 0).unwrap()
    }

    #[test]
    fn reason_priority_order() {
        assert!(ReasonKind::Downtime < ReasonKind::DailyLimitReached);
        assert!(ReasonKind::DailyLimitReached < ReasonKind::LearningGoalNotMet);
        assert!(ReasonKind::LearningGoalNotMet < ReasonKind::RewardBalanceExhausted);
    }

    #[test]
    fn activate_keeps_highest_priority_primary() {
        let mut decision = BlockingDecision::allowed(Some(AppId::new("game")), at());
        assert!(decision.can_unlock());

        decision.activate(ReasonKind::DailyLimitReached);
        assert_eq!(decision.primary_reason, Some(ReasonKind::DailyLimitReached));

        decision.activate(ReasonKind::Downtime);
        assert_eq!(decision.primary_reason, Some(ReasonKind::Downtime));
        assert_eq!(decision.active_reasons.len(), 2);
        assert!(!decision.can_unlock());
    }

    #[test]
    fn block_reason_renders_limit_message() {
        let mut decision = BlockingDecision::allowed(Some(AppId::new("game")), at());
        decision.daily_limit = Some(DailyLimitContext {
            limit_minutes: 60,
            used_minutes: 75,
        });
        decision.activate(ReasonKind::DailyLimitReached);

        let reason = decision.to_block_reason().unwrap();
        assert_eq!(reason.kind, ReasonKind::DailyLimitReached);
        assert_eq!(reason.message, "Daily limit reached: 1h 15m of 1h used today");
    }

    #[test]
    fn allowed_decision_has_no_reason() {
        let decision = BlockingDecision::allowed(None, at());
        assert!(decision.to_block_reason().is_none());
        assert!(decision.message().is_none());
    }

    #[test]
    fn reward_balance_exhaustion() {
        let balance = RewardBalance {
            banked_minutes: 5,
            earned_today_minutes: 10,
            used_today_minutes: 15,
        };
        assert_eq!(balance.available_minutes(), 0);
        assert!(balance.is_exhausted());
    }
}
