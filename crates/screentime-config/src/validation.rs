//! Configuration validation

use crate::schema::{RawApp, RawConfig, RawDays, RawSchedule, RawTimeWindow};
use chrono::DateTime;
use screentime_api::{AppCategory, UNLIMITED_MINUTES};
use std::collections::HashSet;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("App '{app_id}': {message}")]
    AppError { app_id: String, message: String },

    #[error("Duplicate app ID: {0}")]
    DuplicateAppId(String),

    #[error("Token '{token}' is assigned to more than one app")]
    DuplicateToken { token: String },

    #[error("Invalid time format '{value}': {message}")]
    InvalidTimeFormat { value: String, message: String },

    #[error("Invalid day specification: {0}")]
    InvalidDaySpec(String),

    #[error("App '{app_id}': {day} is covered by more than one {what}")]
    OverlappingDays {
        app_id: String,
        day: String,
        what: &'static str,
    },

    #[error("Global config error: {0}")]
    GlobalError(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut seen_ids = HashSet::new();
    for app in &config.apps {
        if !seen_ids.insert(&app.id) {
            errors.push(ValidationError::DuplicateAppId(app.id.clone()));
        }
    }

    let mut seen_tokens = HashSet::new();
    for token in config.apps.iter().flat_map(|a| a.tokens.iter()) {
        if !seen_tokens.insert(token) {
            errors.push(ValidationError::DuplicateToken {
                token: token.clone(),
            });
        }
    }

    for app in &config.apps {
        errors.extend(validate_app(app));
    }

    errors.extend(validate_globals(config));

    errors
}

fn validate_globals(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let service = &config.service;

    if service.refresh_interval_seconds == Some(0) {
        errors.push(ValidationError::GlobalError(
            "refresh_interval_seconds must be greater than 0".into(),
        ));
    }
    if service.threshold_step_seconds == Some(0) {
        errors.push(ValidationError::GlobalError(
            "threshold_step_seconds must be greater than 0".into(),
        ));
    }
    if let (Some(step), Some(ceiling)) = (
        service.threshold_step_seconds,
        service.threshold_ceiling_seconds,
    ) && ceiling < step
    {
        errors.push(ValidationError::GlobalError(format!(
            "threshold_ceiling_seconds ({}) is below threshold_step_seconds ({})",
            ceiling, step
        )));
    }
    if config.reconciliation.freshness_seconds == Some(0) {
        errors.push(ValidationError::GlobalError(
            "reconciliation.freshness_seconds must be greater than 0".into(),
        ));
    }

    errors
}

fn validate_app(app: &RawApp) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let app_err = |message: String| ValidationError::AppError {
        app_id: app.id.clone(),
        message,
    };

    if app.id.trim().is_empty() {
        errors.push(app_err("id cannot be empty".into()));
    }
    if app.tokens.iter().any(|t| t.trim().is_empty()) {
        errors.push(app_err("tokens cannot be empty strings".into()));
    }

    let Some(schedule) = &app.schedule else {
        return errors;
    };

    if app.category == AppCategory::Learning && !schedule.linked.is_empty() {
        errors.push(app_err(
            "linked learning apps only apply to reward apps".into(),
        ));
    }

    errors.extend(validate_schedule(schedule, &app.id));
    errors
}

fn validate_schedule(schedule: &RawSchedule, app_id: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut window_days = 0u8;
    for window in &schedule.windows {
        errors.extend(validate_time_window(window, app_id));
        if let Ok(mask) = parse_days(&window.days) {
            errors.extend(overlaps(window_days, mask, app_id, "window"));
            window_days |= mask;
        }
    }

    let mut limit_days = 0u8;
    for limit in &schedule.limits {
        match parse_days(&limit.days) {
            Ok(mask) => {
                errors.extend(overlaps(limit_days, mask, app_id, "daily limit"));
                limit_days |= mask;
            }
            Err(e) => errors.push(ValidationError::InvalidDaySpec(e)),
        }
        if limit.minutes > UNLIMITED_MINUTES {
            errors.push(ValidationError::AppError {
                app_id: app_id.to_string(),
                message: format!(
                    "daily limit {} exceeds {} minutes",
                    limit.minutes, UNLIMITED_MINUTES
                ),
            });
        }
    }

    let mut linked_ids = HashSet::new();
    for linked in &schedule.linked {
        if linked.app == app_id {
            errors.push(ValidationError::AppError {
                app_id: app_id.to_string(),
                message: "an app cannot be linked to itself".into(),
            });
        }
        if !linked_ids.insert(&linked.app) {
            errors.push(ValidationError::AppError {
                app_id: app_id.to_string(),
                message: format!("learning app '{}' linked twice", linked.app),
            });
        }
    }

    if let Some(streak) = &schedule.streak
        && streak.enabled
        && streak.days_required == 0
    {
        errors.push(ValidationError::AppError {
            app_id: app_id.to_string(),
            message: "streak days_required must be at least 1".into(),
        });
    }

    if let Some(modified_at) = &schedule.modified_at
        && let Err(e) = DateTime::parse_from_rfc3339(modified_at)
    {
        errors.push(ValidationError::AppError {
            app_id: app_id.to_string(),
            message: format!("invalid modified_at '{}': {}", modified_at, e),
        });
    }

    errors
}

fn overlaps(seen: u8, mask: u8, app_id: &str, what: &'static str) -> Option<ValidationError> {
    let clash = seen & mask;
    if clash == 0 {
        return None;
    }
    let day = screentime_util::DaysOfWeek::new(clash)
        .iter()
        .next()
        .map(screentime_util::weekday_name)
        .unwrap_or("day");
    Some(ValidationError::OverlappingDays {
        app_id: app_id.to_string(),
        day: day.to_string(),
        what,
    })
}

fn validate_time_window(window: &RawTimeWindow, app_id: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Err(e) = parse_days(&window.days) {
        errors.push(ValidationError::AppError {
            app_id: app_id.to_string(),
            message: e,
        });
    }

    if let Err(e) = parse_time(&window.start) {
        errors.push(ValidationError::InvalidTimeFormat {
            value: window.start.clone(),
            message: e,
        });
    }

    if let Err(e) = parse_time(&window.end) {
        errors.push(ValidationError::InvalidTimeFormat {
            value: window.end.clone(),
            message: e,
        });
    }

    errors
}

/// Parse HH:MM time format
pub fn parse_time(s: &str) -> Result<(u8, u8), String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 {
        return Err("Expected HH:MM format".into());
    }

    let hour: u8 = parts[0]
        .parse()
        .map_err(|_| "Invalid hour".to_string())?;
    let minute: u8 = parts[1]
        .parse()
        .map_err(|_| "Invalid minute".to_string())?;

    if hour >= 24 {
        return Err("Hour must be 0-23".into());
    }
    if minute >= 60 {
        return Err("Minute must be 0-59".into());
    }

    Ok((hour, minute))
}

/// Parse days specification
pub fn parse_days(days: &RawDays) -> Result<u8, String> {
    match days {
        RawDays::Preset(preset) => match preset.to_lowercase().as_str() {
            "all" | "every" | "daily" => Ok(0x7F),
            "weekdays" => Ok(0x1F), // Mon-Fri
            "weekends" => Ok(0x60), // Sat-Sun
            other => Err(format!("Unknown day preset: {}", other)),
        },
        RawDays::List(list) => {
            let mut mask = 0u8;
            for day in list {
                let bit = match day.to_lowercase().as_str() {
                    "mon" | "monday" => 1 << 0,
                    "tue" | "tuesday" => 1 << 1,
                    "wed" | "wednesday" => 1 << 2,
                    "thu" | "thursday" => 1 << 3,
                    "fri" | "friday" => 1 << 4,
                    "sat" | "saturday" => 1 << 5,
                    "sun" | "sunday" => 1 << 6,
                    other => return Err(format!("Unknown day: {}", other)),
                };
                mask |= bit;
            }
            Ok(mask)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RawDailyLimit, RawLinkedApp};

    fn reward_app(id: &str, schedule: Option<RawSchedule>) -> RawApp {
        RawApp {
            id: id.into(),
            label: id.into(),
            category: AppCategory::Reward,
            tokens: vec![format!("tok-{}", id)],
            reward_points_per_minute: 1,
            schedule,
        }
    }

    fn empty_schedule() -> RawSchedule {
        RawSchedule {
            enabled: true,
            unlock_mode: Default::default(),
            modified_at: None,
            windows: vec![],
            limits: vec![],
            linked: vec![],
            streak: None,
        }
    }

    fn config(apps: Vec<RawApp>) -> RawConfig {
        RawConfig {
            config_version: 1,
            service: Default::default(),
            validator: Default::default(),
            reconciliation: Default::default(),
            goals: Default::default(),
            apps,
        }
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("14:30").unwrap(), (14, 30));
        assert_eq!(parse_time("00:00").unwrap(), (0, 0));
        assert_eq!(parse_time("23:59").unwrap(), (23, 59));

        assert!(parse_time("24:00").is_err());
        assert!(parse_time("12:60").is_err());
        assert!(parse_time("invalid").is_err());
    }

    #[test]
    fn test_parse_days() {
        assert_eq!(parse_days(&RawDays::Preset("weekdays".into())).unwrap(), 0x1F);
        assert_eq!(parse_days(&RawDays::Preset("weekends".into())).unwrap(), 0x60);
        assert_eq!(parse_days(&RawDays::Preset("all".into())).unwrap(), 0x7F);

        assert_eq!(
            parse_days(&RawDays::List(vec!["mon".into(), "wed".into(), "fri".into()])).unwrap(),
            0b10101
        );
    }

    #[test]
    fn test_duplicate_id_detection() {
        let mut second = reward_app("game", None);
        second.tokens = vec!["tok-other".into()];
        let errors = validate_config(&config(vec![reward_app("game", None), second]));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicateAppId(_))));
    }

    #[test]
    fn test_duplicate_token_detection() {
        let mut second = reward_app("other", None);
        second.tokens = vec!["tok-game".into()];
        let errors = validate_config(&config(vec![reward_app("game", None), second]));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicateToken { .. })));
    }

    #[test]
    fn test_overlapping_limits() {
        let mut schedule = empty_schedule();
        schedule.limits = vec![
            RawDailyLimit {
                days: RawDays::Preset("all".into()),
                minutes: 60,
            },
            RawDailyLimit {
                days: RawDays::List(vec!["sat".into()]),
                minutes: 120,
            },
        ];

        let errors = validate_config(&config(vec![reward_app("game", Some(schedule))]));
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::OverlappingDays { day, .. } if day == "Saturday"
        )));
    }

    #[test]
    fn test_goal_on_learning_app_rejected() {
        let mut schedule = empty_schedule();
        schedule.linked = vec![RawLinkedApp {
            app: "khan".into(),
            display_name: None,
            minutes_required: 15,
            reward_minutes: None,
            ratio_learning_minutes: None,
        }];
        let mut app = reward_app("duolingo", Some(schedule));
        app.category = AppCategory::Learning;

        let errors = validate_config(&config(vec![app]));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::AppError { .. })));
    }

    #[test]
    fn test_bad_modified_at() {
        let mut schedule = empty_schedule();
        schedule.modified_at = Some("yesterday".into());
        let errors = validate_config(&config(vec![reward_app("game", Some(schedule))]));
        assert_eq!(errors.len(), 1);
    }
}
