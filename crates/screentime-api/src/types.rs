//! Schedule model and usage inputs shared across screentime

use chrono::{DateTime, Local, Weekday};
use serde::{Deserialize, Serialize};
use screentime_util::{AppId, AppToken, ClockWindow, EventName, WallClock, weekday_index};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Daily limit value meaning "no cap"
pub const UNLIMITED_MINUTES: u32 = 1440;

/// What role an app plays in the reward economy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppCategory {
    /// Usage earns reward minutes
    Learning,
    /// Usage spends reward minutes and is gated on learning goals
    Reward,
}

impl fmt::Display for AppCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppCategory::Learning => write!(f, "learning"),
            AppCategory::Reward => write!(f, "reward"),
        }
    }
}

/// How the goals of several linked learning apps combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockMode {
    /// Every linked app must meet its own requirement
    #[default]
    RequireAll,
    /// Any single linked app meeting its requirement is enough
    RequireAny,
}

/// Allowed usage window for one day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DayWindow {
    #[default]
    FullDay,
    Window(ClockWindow),
}

impl DayWindow {
    pub fn is_full_day(&self) -> bool {
        matches!(self, DayWindow::FullDay)
    }

    pub fn allows(&self, time: WallClock) -> bool {
        match self {
            DayWindow::FullDay => true,
            DayWindow::Window(window) => window.contains(time),
        }
    }
}

impl fmt::Display for DayWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayWindow::FullDay => write!(f, "all day"),
            DayWindow::Window(window) => write!(f, "{}", window),
        }
    }
}

/// Allowed window for each day of the week, Monday first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeeklyWindows {
    days: [DayWindow; 7],
}

impl WeeklyWindows {
    /// Same window every day
    pub fn uniform(window: DayWindow) -> Self {
        Self { days: [window; 7] }
    }

    pub fn for_day(&self, day: Weekday) -> DayWindow {
        self.days[weekday_index(day)]
    }

    pub fn set(&mut self, day: Weekday, window: DayWindow) {
        self.days[weekday_index(day)] = window;
    }

    /// Windows in Monday-first order
    pub fn as_array(&self) -> &[DayWindow; 7] {
        &self.days
    }
}

/// Per-day minute caps, Monday first. `UNLIMITED_MINUTES` means no cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyLimits {
    minutes: [u32; 7],
}

impl DailyLimits {
    pub fn unlimited() -> Self {
        Self::uniform(UNLIMITED_MINUTES)
    }

    pub fn uniform(minutes: u32) -> Self {
        Self { minutes: [minutes.min(UNLIMITED_MINUTES); 7] }
    }

    pub fn for_day(&self, day: Weekday) -> u32 {
        self.minutes[weekday_index(day)]
    }

    pub fn set(&mut self, day: Weekday, minutes: u32) {
        self.minutes[weekday_index(day)] = minutes.min(UNLIMITED_MINUTES);
    }

    pub fn is_limited(&self, day: Weekday) -> bool {
        self.for_day(day) < UNLIMITED_MINUTES
    }
}

impl Default for DailyLimits {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// A learning app whose usage unlocks a reward app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedLearningApp {
    pub app_id: AppId,
    /// Display name, used when the logical ID no longer resolves
    #[serde(default)]
    pub display_name: Option<String>,
    pub minutes_required: u32,
    /// Reward minutes granted per `ratio_learning_minutes` of learning
    pub reward_minutes_earned: u32,
    pub ratio_learning_minutes: u32,
}

impl LinkedLearningApp {
    pub fn new(app_id: impl Into<AppId>, minutes_required: u32) -> Self {
        Self {
            app_id: app_id.into(),
            display_name: None,
            minutes_required,
            reward_minutes_earned: minutes_required,
            ratio_learning_minutes: minutes_required.max(1),
        }
    }

    pub fn with_ratio(mut self, learning_minutes: u32, reward_minutes: u32) -> Self {
        self.ratio_learning_minutes = learning_minutes;
        self.reward_minutes_earned = reward_minutes;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Learning minutes per reward grant, never zero
    pub fn ratio(&self) -> u32 {
        self.ratio_learning_minutes.max(1)
    }
}

/// Bonus for consecutive days with the learning goal met
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakSettings {
    pub enabled: bool,
    pub days_required: u32,
    pub bonus_minutes: u32,
}

/// Restrictions configured for one app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfiguration {
    pub app_id: AppId,
    pub allowed_windows: WeeklyWindows,
    pub daily_limits: DailyLimits,
    pub linked_learning_apps: Vec<LinkedLearningApp>,
    pub unlock_mode: UnlockMode,
    pub streak_settings: Option<StreakSettings>,
    pub is_enabled: bool,
    pub modified_at: DateTime<Local>,
}

impl ScheduleConfiguration {
    /// An enabled schedule with no window, limit or goal
    pub fn unrestricted(app_id: impl Into<AppId>, modified_at: DateTime<Local>) -> Self {
        Self {
            app_id: app_id.into(),
            allowed_windows: WeeklyWindows::default(),
            daily_limits: DailyLimits::unlimited(),
            linked_learning_apps: Vec::new(),
            unlock_mode: UnlockMode::RequireAll,
            streak_settings: None,
            is_enabled: true,
            modified_at,
        }
    }

    pub fn has_goal(&self) -> bool {
        !self.linked_learning_apps.is_empty()
    }
}

/// "Usage threshold crossed" notification from the usage monitor.
///
/// Delivered at least once; may be duplicated or replayed in bursts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_name: EventName,
    pub app_token: AppToken,
    pub cumulative_threshold_seconds: u64,
    pub fired_at: DateTime<Local>,
}

/// Independently captured cumulative usage for today, per app token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub captured_at: DateTime<Local>,
    pub reported: BTreeMap<AppToken, u64>,
}

/// Instruction for the shield collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "tokens", rename_all = "snake_case")]
pub enum ShieldUpdate {
    Replace(BTreeSet<AppToken>),
    Union(BTreeSet<AppToken>),
    Subtract(BTreeSet<AppToken>),
}

impl ShieldUpdate {
    /// Apply this update to an enforced set
    pub fn apply_to(&self, shielded: &mut BTreeSet<AppToken>) {
        match self {
            ShieldUpdate::Replace(tokens) => *shielded = tokens.clone(),
            ShieldUpdate::Union(tokens) => shielded.extend(tokens.iter().cloned()),
            ShieldUpdate::Subtract(tokens) => shielded.retain(|t| !tokens.contains(t)),
        }
    }
}
