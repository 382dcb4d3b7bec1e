//! Validated policy structures

use crate::schema::{
    RawApp, RawConfig, RawDailyLimit, RawGoalsConfig, RawLinkedApp, RawReconcileConfig,
    RawSchedule, RawServiceConfig, RawTimeWindow, RawValidatorConfig,
};
use crate::validation::{parse_days, parse_time};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use screentime_api::{
    AppCategory, DailyLimits, DayWindow, LinkedLearningApp, ScheduleConfiguration,
    StreakSettings, WeeklyWindows,
};
use screentime_util::{AppId, AppToken, ClockWindow, DaysOfWeek, WallClock};
use std::path::PathBuf;
use std::time::Duration;

/// Validated policy ready for use by the core engine
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub service: ServiceConfig,
    pub validator: ValidatorSettings,
    pub reconciliation: ReconcileSettings,
    pub goals: GoalSettings,

    /// Validated apps
    pub apps: Vec<AppEntry>,
}

impl Policy {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceConfig::from_raw(raw.service),
            validator: ValidatorSettings::from_raw(raw.validator),
            reconciliation: ReconcileSettings::from_raw(raw.reconciliation),
            goals: GoalSettings::from_raw(raw.goals),
            apps: raw.apps.into_iter().map(AppEntry::from_raw).collect(),
        }
    }

    /// Get app by ID
    pub fn get_app(&self, id: &AppId) -> Option<&AppEntry> {
        self.apps.iter().find(|a| &a.id == id)
    }

    /// App that owns an OS token
    pub fn app_for_token(&self, token: &AppToken) -> Option<&AppEntry> {
        self.apps.iter().find(|a| a.tokens.contains(token))
    }

    /// Apps in the reward category
    pub fn reward_apps(&self) -> impl Iterator<Item = &AppEntry> {
        self.apps
            .iter()
            .filter(|a| a.category == AppCategory::Reward)
    }
}

/// Shield behavior when monitoring stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnStop {
    /// Remove every shield
    #[default]
    Clear,
    /// Leave the current shields in place
    Preserve,
}

/// Which learning minutes feed the reward formula
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardBasis {
    /// Minutes actually used, even past the requirement
    #[default]
    Actual,
    /// Minutes capped at each app's requirement
    Capped,
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub refresh_interval: Duration,
    pub threshold_step: Duration,
    pub threshold_ceiling: Duration,
    pub on_stop: OnStop,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        let defaults = Self::default();
        Self {
            socket_path: raw.socket_path.unwrap_or(defaults.socket_path),
            data_dir: raw.data_dir.unwrap_or(defaults.data_dir),
            refresh_interval: secs_or(raw.refresh_interval_seconds, defaults.refresh_interval),
            threshold_step: secs_or(raw.threshold_step_seconds, defaults.threshold_step),
            threshold_ceiling: secs_or(raw.threshold_ceiling_seconds, defaults.threshold_ceiling),
            on_stop: raw.on_stop.unwrap_or_default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: screentime_util::default_socket_path(),
            data_dir: screentime_util::default_data_dir(),
            refresh_interval: Duration::from_secs(60),
            threshold_step: Duration::from_secs(60),
            threshold_ceiling: Duration::from_secs(24 * 3600),
            on_stop: OnStop::Clear,
        }
    }
}

/// Threshold event filtering windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorSettings {
    /// Events fired this soon after monitoring starts are historical replays
    pub grace_period: Duration,
    /// Minimum spacing of accepted events per app
    pub dedup_window: Duration,
    /// The monitor's smallest threshold increment
    pub min_increment: Duration,
    /// Age at which tracking entries are dropped
    pub prune_after: Duration,
}

impl ValidatorSettings {
    fn from_raw(raw: RawValidatorConfig) -> Self {
        let d = Self::default();
        Self {
            grace_period: secs_or(raw.grace_period_seconds, d.grace_period),
            dedup_window: secs_or(raw.dedup_window_seconds, d.dedup_window),
            min_increment: secs_or(raw.min_increment_seconds, d.min_increment),
            prune_after: secs_or(raw.prune_after_seconds, d.prune_after),
        }
    }
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            dedup_window: Duration::from_secs(55),
            min_increment: Duration::from_secs(60),
            prune_after: Duration::from_secs(3600),
        }
    }
}

/// Snapshot reconciliation bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub freshness: Duration,
    pub recent_event_window: Duration,
    pub slack: Duration,
    pub future_skew: Duration,
}

impl ReconcileSettings {
    fn from_raw(raw: RawReconcileConfig) -> Self {
        let d = Self::default();
        Self {
            freshness: secs_or(raw.freshness_seconds, d.freshness),
            recent_event_window: secs_or(raw.recent_event_window_seconds, d.recent_event_window),
            slack: secs_or(raw.slack_seconds, d.slack),
            future_skew: secs_or(raw.future_skew_seconds, d.future_skew),
        }
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(300),
            recent_event_window: Duration::from_secs(90),
            slack: Duration::from_secs(60),
            future_skew: Duration::from_secs(30),
        }
    }
}

/// Learning goal settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoalSettings {
    pub reward_basis: RewardBasis,
    pub fallback_learning_minutes: u32,
}

impl GoalSettings {
    fn from_raw(raw: RawGoalsConfig) -> Self {
        let d = Self::default();
        Self {
            reward_basis: raw.reward_basis.unwrap_or(d.reward_basis),
            fallback_learning_minutes: raw
                .fallback_learning_minutes
                .unwrap_or(d.fallback_learning_minutes),
        }
    }
}

impl Default for GoalSettings {
    fn default() -> Self {
        Self {
            reward_basis: RewardBasis::Actual,
            fallback_learning_minutes: 15,
        }
    }
}

/// Validated app definition
#[derive(Debug, Clone)]
pub struct AppEntry {
    pub id: AppId,
    pub label: String,
    pub category: AppCategory,
    pub tokens: Vec<AppToken>,
    pub reward_points_per_minute: u32,
    pub schedule: Option<ScheduleConfiguration>,
}

impl AppEntry {
    fn from_raw(raw: RawApp) -> Self {
        let id = AppId::new(raw.id);
        let schedule = raw.schedule.map(|s| convert_schedule(&id, s));

        Self {
            id,
            label: raw.label,
            category: raw.category,
            tokens: raw.tokens.into_iter().map(AppToken::new).collect(),
            reward_points_per_minute: raw.reward_points_per_minute,
            schedule,
        }
    }

    /// The schedule, if one is configured and enabled
    pub fn active_schedule(&self) -> Option<&ScheduleConfiguration> {
        self.schedule.as_ref().filter(|s| s.is_enabled)
    }
}

// Conversion helpers

fn secs_or(raw: Option<u64>, default: Duration) -> Duration {
    raw.map(Duration::from_secs).unwrap_or(default)
}

/// Timestamp for schedules that never recorded an edit
fn unmodified() -> DateTime<Local> {
    DateTime::<Utc>::default().with_timezone(&Local)
}

fn convert_schedule(app_id: &AppId, raw: RawSchedule) -> ScheduleConfiguration {
    let modified_at = raw
        .modified_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Local))
        .unwrap_or_else(unmodified);

    let mut schedule = ScheduleConfiguration::unrestricted(app_id.clone(), modified_at);
    schedule.is_enabled = raw.enabled;
    schedule.unlock_mode = raw.unlock_mode;
    schedule.allowed_windows = convert_windows(raw.windows);
    schedule.daily_limits = convert_limits(raw.limits);
    schedule.linked_learning_apps = raw.linked.into_iter().map(convert_linked).collect();
    schedule.streak_settings = raw.streak.map(|s| StreakSettings {
        enabled: s.enabled,
        days_required: s.days_required.max(1),
        bonus_minutes: s.bonus_minutes,
    });
    schedule
}

fn convert_windows(raw: Vec<RawTimeWindow>) -> WeeklyWindows {
    let mut windows = WeeklyWindows::default();
    for window in raw {
        let days = DaysOfWeek::new(parse_days(&window.days).unwrap_or(0x7F));
        let (start_h, start_m) = parse_time(&window.start).unwrap_or((0, 0));
        let (end_h, end_m) = parse_time(&window.end).unwrap_or((0, 0));
        let clock = ClockWindow::new(
            WallClock::new(start_h, start_m).unwrap_or(WallClock::MIDNIGHT),
            WallClock::new(end_h, end_m).unwrap_or(WallClock::MIDNIGHT),
        );
        for day in days.iter() {
            windows.set(day, DayWindow::Window(clock));
        }
    }
    windows
}

fn convert_limits(raw: Vec<RawDailyLimit>) -> DailyLimits {
    let mut limits = DailyLimits::unlimited();
    for limit in raw {
        let days = DaysOfWeek::new(parse_days(&limit.days).unwrap_or(0x7F));
        for day in days.iter() {
            limits.set(day, limit.minutes);
        }
    }
    limits
}

fn convert_linked(raw: RawLinkedApp) -> LinkedLearningApp {
    let mut linked = LinkedLearningApp::new(raw.app, raw.minutes_required);
    if let Some(reward) = raw.reward_minutes {
        linked.reward_minutes_earned = reward;
    }
    if let Some(ratio) = raw.ratio_learning_minutes {
        linked.ratio_learning_minutes = ratio.max(1);
    }
    if let Some(name) = raw.display_name {
        linked = linked.with_display_name(name);
    }
    linked
}
