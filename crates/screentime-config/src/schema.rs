//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use screentime_api::{AppCategory, UnlockMode};
use std::path::PathBuf;

use crate::policy::{OnStop, RewardBasis};

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Service-level settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Threshold event filtering
    #[serde(default)]
    pub validator: RawValidatorConfig,

    /// Snapshot reconciliation
    #[serde(default)]
    pub reconciliation: RawReconcileConfig,

    /// Learning goal and reward settings
    #[serde(default)]
    pub goals: RawGoalsConfig,

    /// Monitored apps
    #[serde(default)]
    pub apps: Vec<RawApp>,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path (default: $XDG_RUNTIME_DIR/screentime/screentimed.sock)
    pub socket_path: Option<PathBuf>,

    /// Data directory for the store
    pub data_dir: Option<PathBuf>,

    /// How often shields and reasons are refreshed
    pub refresh_interval_seconds: Option<u64>,

    /// Spacing of the threshold ladder registered with the monitor
    pub threshold_step_seconds: Option<u64>,

    /// Highest threshold registered (default: 24h)
    pub threshold_ceiling_seconds: Option<u64>,

    /// What happens to shields when monitoring stops
    pub on_stop: Option<OnStop>,
}

/// Threshold event filtering
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawValidatorConfig {
    pub grace_period_seconds: Option<u64>,
    pub dedup_window_seconds: Option<u64>,
    pub min_increment_seconds: Option<u64>,
    pub prune_after_seconds: Option<u64>,
}

/// Snapshot reconciliation
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawReconcileConfig {
    pub freshness_seconds: Option<u64>,
    pub recent_event_window_seconds: Option<u64>,
    pub slack_seconds: Option<u64>,
    /// Tolerated clock skew for snapshots stamped in the future
    pub future_skew_seconds: Option<u64>,
}

/// Learning goal and reward settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawGoalsConfig {
    /// "actual" (uncapped learning minutes) or "capped" (at the requirement)
    pub reward_basis: Option<RewardBasis>,

    /// Required learning when an app cannot be resolved
    pub fallback_learning_minutes: Option<u32>,
}

/// Raw app definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawApp {
    /// Stable logical ID
    pub id: String,

    /// Display label, also used for name-based fallback lookup
    pub label: String,

    pub category: AppCategory,

    /// Opaque tokens the OS uses for this app
    #[serde(default)]
    pub tokens: Vec<String>,

    /// Reward points credited per minute of use
    #[serde(default = "default_points_per_minute")]
    pub reward_points_per_minute: u32,

    /// Restrictions; absent means unrestricted
    #[serde(default)]
    pub schedule: Option<RawSchedule>,
}

fn default_points_per_minute() -> u32 {
    1
}

/// Schedule for one app
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawSchedule {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub unlock_mode: UnlockMode,

    /// RFC 3339 timestamp of the last edit; used against remote commands
    pub modified_at: Option<String>,

    /// Allowed windows; days not listed are allowed all day
    #[serde(default)]
    pub windows: Vec<RawTimeWindow>,

    /// Daily minute caps; days not listed are unlimited
    #[serde(default)]
    pub limits: Vec<RawDailyLimit>,

    /// Learning apps gating this app
    #[serde(default)]
    pub linked: Vec<RawLinkedApp>,

    #[serde(default)]
    pub streak: Option<RawStreak>,
}

fn default_enabled() -> bool {
    true
}

/// Time window
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawTimeWindow {
    /// Days of week: "weekdays", "weekends", "all", or list like ["mon", "tue", "wed"]
    pub days: RawDays,

    /// Start time (HH:MM format)
    pub start: String,

    /// End time (HH:MM format); earlier than start crosses midnight
    pub end: String,
}

/// Days specification
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RawDays {
    Preset(String),
    List(Vec<String>),
}

/// Daily cap for a set of days
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawDailyLimit {
    pub days: RawDays,
    pub minutes: u32,
}

/// Linked learning app
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawLinkedApp {
    /// Logical ID of the learning app
    pub app: String,

    pub display_name: Option<String>,

    pub minutes_required: u32,

    /// Reward minutes per `ratio_learning_minutes` (default: minutes_required)
    pub reward_minutes: Option<u32>,

    /// Learning minutes per reward grant (default: minutes_required)
    pub ratio_learning_minutes: Option<u32>,
}

/// Streak bonus
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawStreak {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub days_required: u32,
    pub bonus_minutes: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reward_app() {
        let toml_str = r#"
            config_version = 1

            [[apps]]
            id = "minecraft"
            label = "Minecraft"
            category = "reward"
            tokens = ["tok-minecraft"]

            [apps.schedule]
            unlock_mode = "require_any"

            [[apps.schedule.limits]]
            days = "all"
            minutes = 60

            [[apps.schedule.linked]]
            app = "khan"
            minutes_required = 15
        "#;

        let config: RawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.apps.len(), 1);
        let schedule = config.apps[0].schedule.as_ref().unwrap();
        assert!(schedule.enabled);
        assert_eq!(schedule.unlock_mode, UnlockMode::RequireAny);
        assert_eq!(schedule.linked[0].app, "khan");
        assert_eq!(config.apps[0].reward_points_per_minute, 1);
    }

    #[test]
    fn parse_time_windows() {
        let toml_str = r#"
            config_version = 1

            [[apps]]
            id = "game"
            label = "Game"
            category = "reward"

            [apps.schedule]
            [[apps.schedule.windows]]
            days = "weekdays"
            start = "14:00"
            end = "18:00"

            [[apps.schedule.windows]]
            days = ["sat", "sun"]
            start = "10:00"
            end = "20:00"
        "#;

        let config: RawConfig = toml::from_str(toml_str).unwrap();
        let schedule = config.apps[0].schedule.as_ref().unwrap();
        assert_eq!(schedule.windows.len(), 2);
    }

    #[test]
    fn parse_service_sections() {
        let toml_str = r#"
            config_version = 1

            [service]
            on_stop = "preserve"
            refresh_interval_seconds = 30

            [goals]
            reward_basis = "capped"
        "#;

        let config: RawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.service.on_stop, Some(OnStop::Preserve));
        assert_eq!(config.goals.reward_basis, Some(RewardBasis::Capped));
    }
}
