//! Learning goal progress and reward-minute accrual

use screentime_api::{GoalProgress, LinkedLearningApp, ScheduleConfiguration, UnlockMode};
use screentime_config::RewardBasis;
use screentime_util::AppId;

/// Names that cannot identify an app
const PLACEHOLDER_NAMES: &[&str] = &["unknown", "unknown app", "app", "learning app"];

/// Minutes used by learning apps on some day
pub trait UsageLookup {
    /// Minutes for an app by logical ID; None when the ID is unknown
    fn minutes_for_id(&self, app_id: &AppId) -> Option<u32>;

    /// Minutes for an app whose display name matches, ignoring case
    fn minutes_for_name(&self, name: &str) -> Option<u32>;
}

pub fn is_placeholder_name(name: &str) -> bool {
    let name = name.trim();
    name.is_empty() || PLACEHOLDER_NAMES.iter().any(|p| name.eq_ignore_ascii_case(p))
}

/// Minutes used by a linked app: exact ID first, then display name
pub fn resolve_minutes(lookup: &dyn UsageLookup, linked: &LinkedLearningApp) -> u32 {
    if let Some(minutes) = lookup.minutes_for_id(&linked.app_id) {
        return minutes;
    }
    match linked.display_name.as_deref() {
        Some(name) if !is_placeholder_name(name) => lookup.minutes_for_name(name).unwrap_or(0),
        _ => 0,
    }
}

/// Reward minutes one linked app has earned from `used` minutes
pub fn reward_for(linked: &LinkedLearningApp, used: u32, basis: RewardBasis) -> u32 {
    let basis_minutes = match basis {
        RewardBasis::Actual => used,
        RewardBasis::Capped => used.min(linked.minutes_required),
    };
    let earned = u64::from(basis_minutes) * u64::from(linked.reward_minutes_earned)
        / u64::from(linked.ratio());
    u32::try_from(earned).unwrap_or(u32::MAX)
}

/// Evaluate a schedule's learning goal against a usage lookup
pub fn compute_goal_progress(
    schedule: &ScheduleConfiguration,
    lookup: &dyn UsageLookup,
    basis: RewardBasis,
) -> GoalProgress {
    if schedule.linked_learning_apps.is_empty() {
        return GoalProgress::no_goal();
    }

    let usage: Vec<(&LinkedLearningApp, u32)> = schedule
        .linked_learning_apps
        .iter()
        .map(|linked| (linked, resolve_minutes(lookup, linked)))
        .collect();

    match schedule.unlock_mode {
        UnlockMode::RequireAll => require_all(&usage, basis),
        UnlockMode::RequireAny => require_any(&usage, basis),
    }
}

fn require_all(usage: &[(&LinkedLearningApp, u32)], basis: RewardBasis) -> GoalProgress {
    let mut progress = GoalProgress {
        is_goal_met: true,
        ..Default::default()
    };
    let mut reward = 0u32;

    for (linked, used) in usage {
        progress.target_minutes = progress.target_minutes.saturating_add(linked.minutes_required);
        progress.current_minutes = progress
            .current_minutes
            .saturating_add((*used).min(linked.minutes_required));
        reward = reward.saturating_add(reward_for(linked, *used, basis));
        if *used < linked.minutes_required {
            progress.is_goal_met = false;
        }
    }

    progress.reward_minutes_earned = if progress.is_goal_met { reward } else { 0 };
    progress
}

fn require_any(usage: &[(&LinkedLearningApp, u32)], basis: RewardBasis) -> GoalProgress {
    if let Some((linked, used)) = usage.iter().find(|(l, used)| *used >= l.minutes_required) {
        return GoalProgress {
            is_goal_met: true,
            target_minutes: linked.minutes_required,
            current_minutes: (*used).min(linked.minutes_required),
            reward_minutes_earned: reward_for(linked, *used, basis),
        };
    }

    // Nobody met their requirement: report the furthest along, earliest on ties.
    // Every requirement here is above zero since zero is always met.
    let mut best: Option<(&LinkedLearningApp, u32)> = None;
    for (linked, used) in usage {
        let ahead = match best {
            None => true,
            Some((b, b_used)) => {
                u64::from(*used) * u64::from(b.minutes_required)
                    > u64::from(b_used) * u64::from(linked.minutes_required)
            }
        };
        if ahead {
            best = Some((linked, *used));
        }
    }

    match best {
        Some((linked, used)) => GoalProgress {
            is_goal_met: false,
            target_minutes: linked.minutes_required,
            current_minutes: used,
            reward_minutes_earned: 0,
        },
        None => GoalProgress::no_goal(),
    }
}
