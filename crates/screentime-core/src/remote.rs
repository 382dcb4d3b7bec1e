//! Remote configuration conflict resolution

use screentime_api::{CommandStatus, RemoteConfigCommand, ScheduleConfiguration};
use screentime_config::AppEntry;
use screentime_store::AppOverride;

/// Newest `modified_at` wins; the incoming command wins a tie
pub fn resolve(local: Option<&ScheduleConfiguration>, command: &RemoteConfigCommand) -> CommandStatus {
    match local {
        Some(schedule) if command.modified_at < schedule.modified_at => CommandStatus::Superseded,
        _ => CommandStatus::Applied,
    }
}

/// Layer a remote goal linkage onto a configured app, keeping its windows and limits.
///
/// Returns false, leaving the app untouched, when the configured schedule is newer.
pub fn apply_override(app: &mut AppEntry, over: &AppOverride) -> bool {
    if let Some(schedule) = &app.schedule
        && over.modified_at < schedule.modified_at
    {
        return false;
    }

    let schedule = app
        .schedule
        .get_or_insert_with(|| ScheduleConfiguration::unrestricted(app.id.clone(), over.modified_at));
    schedule.linked_learning_apps = over.linked_learning_apps.clone();
    schedule.unlock_mode = over.unlock_mode;
    schedule.streak_settings = over.streak_settings;
    schedule.is_enabled = over.is_enabled;
    schedule.modified_at = over.modified_at;
    app.category = over.category;
    true
}
