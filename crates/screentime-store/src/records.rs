//! Persisted ledger and reward records

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use screentime_api::{
    AppCategory, CommandStatus, LinkedLearningApp, RemoteConfigCommand, StreakSettings, UnlockMode,
};
use screentime_util::AppId;

/// One completed day of usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub seconds: u64,
    pub points: u64,
}

/// Usage counters for one logical app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppUsageRecord {
    pub logical_id: AppId,
    pub display_name: String,
    pub category: AppCategory,
    pub reward_points_per_minute: u32,

    /// Lifetime counters
    pub total_seconds: u64,
    pub earned_points: u64,

    /// Counters for `last_reset_date`
    pub today_seconds: u64,
    pub today_points: u64,
    pub last_reset_date: NaiveDate,

    /// Past days, oldest first; never contains `last_reset_date`
    #[serde(default)]
    pub daily_history: Vec<DailySummary>,

    pub updated_at: DateTime<Local>,
}

impl AppUsageRecord {
    pub fn new(
        logical_id: AppId,
        display_name: impl Into<String>,
        category: AppCategory,
        reward_points_per_minute: u32,
        now: DateTime<Local>,
    ) -> Self {
        Self {
            logical_id,
            display_name: display_name.into(),
            category,
            reward_points_per_minute,
            total_seconds: 0,
            earned_points: 0,
            today_seconds: 0,
            today_points: 0,
            last_reset_date: now.date_naive(),
            daily_history: Vec::new(),
            updated_at: now,
        }
    }

    /// Whole minutes used today
    pub fn today_minutes(&self) -> u32 {
        u32::try_from(self.today_seconds / 60).unwrap_or(u32::MAX)
    }

    /// History entry for a past day
    pub fn history_for(&self, day: NaiveDate) -> Option<&DailySummary> {
        self.daily_history.iter().find(|s| s.date == day)
    }
}

/// Carried-over reward minutes and streak state for a reward app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardBank {
    pub app_id: AppId,
    pub banked_minutes: i64,
    /// Consecutive settled days with the learning goal met
    pub streak_days: u32,
    pub last_settled: Option<NaiveDate>,
}

impl RewardBank {
    pub fn empty(app_id: AppId) -> Self {
        Self {
            app_id,
            banked_minutes: 0,
            streak_days: 0,
            last_settled: None,
        }
    }
}

/// A processed remote configuration command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommandRecord {
    pub command: RemoteConfigCommand,
    pub status: CommandStatus,
    pub received_at: DateTime<Local>,
}

/// Goal linkage set remotely for an app.
///
/// Windows and limits always come from the local configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppOverride {
    pub app_id: AppId,
    pub category: AppCategory,
    pub linked_learning_apps: Vec<LinkedLearningApp>,
    pub unlock_mode: UnlockMode,
    pub streak_settings: Option<StreakSettings>,
    pub is_enabled: bool,
    pub modified_at: DateTime<Local>,
}

impl AppOverride {
    /// Goal linkage carried by a remote command
    pub fn from_command(command: &RemoteConfigCommand) -> Self {
        Self {
            app_id: command.logical_id.clone(),
            category: command.category,
            linked_learning_apps: command.linked_learning_apps.clone(),
            unlock_mode: command.unlock_mode,
            streak_settings: command.streak_settings,
            is_enabled: command.is_enabled,
            modified_at: command.modified_at,
        }
    }
}
