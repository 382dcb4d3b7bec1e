//! Blocking decision evaluation
//!
//! Evaluation is pure with respect to the ledger and schedules: it reads a
//! [`LedgerView`] loaded up front and never writes.

use chrono::{DateTime, Datelike, Local, NaiveDate};
use screentime_api::{
    AppCategory, BlockingDecision, DailyLimitContext, DowntimeContext, GoalProgress, ReasonKind,
    RewardBalance, ScheduleConfiguration,
};
use screentime_config::{AppEntry, GoalSettings};
use screentime_store::{AppUsageRecord, RewardBank, Store};
use screentime_util::{AppId, WallClock, weekday_name};
use std::collections::BTreeMap;

use crate::CoreResult;
use crate::ledger::minutes_on;
use crate::reward::{UsageLookup, compute_goal_progress};
use crate::summary::week_summary;

/// Snapshot of ledger records and reward banks
#[derive(Debug, Clone, Default)]
pub struct LedgerView {
    records: BTreeMap<AppId, AppUsageRecord>,
    banks: BTreeMap<AppId, RewardBank>,
}

impl LedgerView {
    /// Load every record and the banks of the given apps
    pub fn load<'a>(
        store: &dyn Store,
        bank_apps: impl IntoIterator<Item = &'a AppId>,
    ) -> CoreResult<Self> {
        let records = store
            .list_records()?
            .into_iter()
            .map(|r| (r.logical_id.clone(), r))
            .collect();

        let mut banks = BTreeMap::new();
        for id in bank_apps {
            if let Some(bank) = store.load_bank(id)? {
                banks.insert(id.clone(), bank);
            }
        }

        Ok(Self { records, banks })
    }

    pub fn from_parts(records: Vec<AppUsageRecord>, banks: Vec<RewardBank>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.logical_id.clone(), r))
                .collect(),
            banks: banks.into_iter().map(|b| (b.app_id.clone(), b)).collect(),
        }
    }

    pub fn record(&self, app_id: &AppId) -> Option<&AppUsageRecord> {
        self.records.get(app_id)
    }

    pub fn bank(&self, app_id: &AppId) -> Option<&RewardBank> {
        self.banks.get(app_id)
    }

    /// Minutes an app used on `day`; zero when it has no record
    pub fn minutes(&self, app_id: &AppId, day: NaiveDate) -> u32 {
        self.records
            .get(app_id)
            .map(|r| minutes_on(r, day))
            .unwrap_or(0)
    }

    /// Usage lookup for goal progress on one day
    pub fn on(&self, day: NaiveDate) -> DayLookup<'_> {
        DayLookup { view: self, day }
    }
}

/// Per-day usage lookup over a [`LedgerView`]
pub struct DayLookup<'a> {
    view: &'a LedgerView,
    day: NaiveDate,
}

impl UsageLookup for DayLookup<'_> {
    fn minutes_for_id(&self, app_id: &AppId) -> Option<u32> {
        self.view.record(app_id).map(|r| minutes_on(r, self.day))
    }

    fn minutes_for_name(&self, name: &str) -> Option<u32> {
        self.view
            .records
            .values()
            .find(|r| r.display_name.eq_ignore_ascii_case(name.trim()))
            .map(|r| minutes_on(r, self.day))
    }
}

/// Decision for an app whose identity could not be resolved
pub fn fallback_decision(
    app_id: Option<AppId>,
    learning_minutes: u32,
    now: DateTime<Local>,
) -> BlockingDecision {
    let mut decision = BlockingDecision::allowed(app_id, now);
    decision.goal = Some(GoalProgress {
        is_goal_met: false,
        target_minutes: learning_minutes,
        current_minutes: 0,
        reward_minutes_earned: 0,
    });
    decision.activate(ReasonKind::LearningGoalNotMet);
    decision
}

/// Reward apps whose schedule gates them on learning and so share the pool
pub fn tracked_reward_apps(apps: &[AppEntry]) -> impl Iterator<Item = (&AppEntry, &ScheduleConfiguration)> {
    apps.iter().filter_map(|app| {
        if app.category != AppCategory::Reward {
            return None;
        }
        app.active_schedule()
            .filter(|s| s.has_goal())
            .map(|s| (app, s))
    })
}

/// Evaluates apps against their schedules and a ledger view
pub struct Evaluator<'a> {
    apps: &'a [AppEntry],
    view: &'a LedgerView,
    goals: &'a GoalSettings,
}

impl<'a> Evaluator<'a> {
    pub fn new(apps: &'a [AppEntry], view: &'a LedgerView, goals: &'a GoalSettings) -> Self {
        Self { apps, view, goals }
    }

    /// Decide whether an app should be blocked at `now`
    pub fn evaluate(&self, app_id: Option<&AppId>, now: DateTime<Local>) -> BlockingDecision {
        let Some(app) = app_id.and_then(|id| self.apps.iter().find(|a| &a.id == id)) else {
            return fallback_decision(
                app_id.cloned(),
                self.goals.fallback_learning_minutes,
                now,
            );
        };

        let mut decision = BlockingDecision::allowed(Some(app.id.clone()), now);
        let Some(schedule) = app.active_schedule() else {
            return decision;
        };

        let today = now.date_naive();
        let weekday = now.weekday();

        let allowed = schedule.allowed_windows.for_day(weekday);
        if !allowed.allows(WallClock::from_naive_time(now.time())) {
            decision.downtime = Some(DowntimeContext {
                day_name: weekday_name(weekday).to_string(),
                allowed,
                week_summary: week_summary(&schedule.allowed_windows),
            });
            decision.activate(ReasonKind::Downtime);
        }

        if schedule.daily_limits.is_limited(weekday) {
            let limit = schedule.daily_limits.for_day(weekday);
            let used = self.view.minutes(&app.id, today);
            decision.daily_limit = Some(DailyLimitContext {
                limit_minutes: limit,
                used_minutes: used,
            });
            if used >= limit {
                decision.activate(ReasonKind::DailyLimitReached);
            }
        }

        if app.category == AppCategory::Reward {
            let progress = self.goal_progress(schedule, today);
            decision.goal = Some(progress);

            if !progress.is_goal_met {
                decision.activate(ReasonKind::LearningGoalNotMet);
            } else if schedule.has_goal() {
                let balance = self.reward_balance(today);
                decision.reward_balance = Some(balance);
                if balance.is_exhausted() {
                    decision.activate(ReasonKind::RewardBalanceExhausted);
                }
            }
        }

        decision
    }

    /// Learning goal progress of a schedule on `day`
    pub fn goal_progress(&self, schedule: &ScheduleConfiguration, day: NaiveDate) -> GoalProgress {
        compute_goal_progress(schedule, &self.view.on(day), self.goals.reward_basis)
    }

    /// Shared reward pool across every tracked reward app
    pub fn reward_balance(&self, day: NaiveDate) -> RewardBalance {
        let mut balance = RewardBalance::default();
        for (app, schedule) in tracked_reward_apps(self.apps) {
            balance.banked_minutes += self
                .view
                .bank(&app.id)
                .map(|b| b.banked_minutes)
                .unwrap_or(0);
            balance.earned_today_minutes +=
                i64::from(self.goal_progress(schedule, day).reward_minutes_earned);
            balance.used_today_minutes += i64::from(self.view.minutes(&app.id, day));
        }
        balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::credit;
    use chrono::TimeZone;
    use screentime_api::{DailyLimits, DayWindow, LinkedLearningApp, WeeklyWindows};
    use screentime_config::RewardBasis;
    use screentime_util::{AppToken, ClockWindow};

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        // Monday
        Local.with_ymd_and_hms(2025, 12, 29, hour, minute, 0).unwrap()
    }

    fn window(start: u8, end: u8) -> DayWindow {
        DayWindow::Window(ClockWindow::new(
            WallClock::new(start, 0).unwrap(),
            WallClock::new(end, 0).unwrap(),
        ))
    }

    fn app(id: &str, category: AppCategory, schedule: Option<ScheduleConfiguration>) -> AppEntry {
        AppEntry {
            id: AppId::new(id),
            label: id.to_string(),
            category,
            tokens: vec![AppToken::new(format!("tok-{}", id))],
            reward_points_per_minute: 1,
            schedule,
        }
    }

    fn record(id: &str, category: AppCategory, seconds: u64) -> AppUsageRecord {
        let mut r = AppUsageRecord::new(AppId::new(id), id, category, 1, at(0, 0));
        if seconds > 0 {
            credit(&mut r, seconds, 1, at(8, 0));
        }
        r
    }

    fn game_schedule() -> ScheduleConfiguration {
        ScheduleConfiguration::unrestricted("game", at(0, 0))
    }

    #[test]
    fn no_schedule_means_allowed() {
        let apps = vec![app("game", AppCategory::Reward, None)];
        let view = LedgerView::default();
        let goals = GoalSettings::default();

        let decision = Evaluator::new(&apps, &view, &goals).evaluate(Some(&AppId::new("game")), at(21, 0));
        assert!(!decision.should_block);
        assert!(decision.active_reasons.is_empty());
    }

    #[test]
    fn disabled_schedule_is_ignored() {
        let mut schedule = game_schedule();
        schedule.daily_limits = DailyLimits::uniform(0);
        schedule.is_enabled = false;
        let apps = vec![app("game", AppCategory::Reward, Some(schedule))];
        let view = LedgerView::default();
        let goals = GoalSettings::default();

        let decision = Evaluator::new(&apps, &view, &goals).evaluate(Some(&AppId::new("game")), at(12, 0));
        assert!(decision.can_unlock());
    }

    #[test]
    fn reward_app_without_goal_skips_balance() {
        let apps = vec![app("game", AppCategory::Reward, Some(game_schedule()))];
        let view = LedgerView::from_parts(vec![record("game", AppCategory::Reward, 3600)], vec![]);
        let goals = GoalSettings::default();

        let decision = Evaluator::new(&apps, &view, &goals).evaluate(Some(&AppId::new("game")), at(12, 0));
        assert!(decision.can_unlock());
        assert!(decision.reward_balance.is_none());
        assert_eq!(tracked_reward_apps(&apps).count(), 0);
    }

    #[test]
    fn unresolved_identity_gets_fallback() {
        let apps = vec![];
        let view = LedgerView::default();
        let goals = GoalSettings::default();

        let decision = Evaluator::new(&apps, &view, &goals).evaluate(None, at(12, 0));
        assert!(decision.should_block);
        assert_eq!(decision.primary_reason, Some(ReasonKind::LearningGoalNotMet));
        assert_eq!(decision.goal.unwrap().target_minutes, 15);
    }

    #[test]
    fn downtime_outranks_daily_limit() {
        let mut schedule = game_schedule();
        schedule.allowed_windows = WeeklyWindows::uniform(window(15, 19));
        schedule.daily_limits = DailyLimits::uniform(60);
        let apps = vec![app("game", AppCategory::Reward, Some(schedule))];
        let view = LedgerView::from_parts(vec![record("game", AppCategory::Reward, 75 * 60)], vec![]);
        let goals = GoalSettings::default();

        let decision = Evaluator::new(&apps, &view, &goals).evaluate(Some(&AppId::new("game")), at(21, 0));
        assert!(decision.should_block);
        assert_eq!(decision.primary_reason, Some(ReasonKind::Downtime));
        assert!(decision.is_active(ReasonKind::Downtime));
        assert!(decision.is_active(ReasonKind::DailyLimitReached));

        let downtime = decision.downtime.unwrap();
        assert_eq!(downtime.day_name, "Monday");
        assert_eq!(downtime.week_summary, "Every day: 15:00-19:00");
    }

    #[test]
    fn limit_not_reached_below_cap() {
        let mut schedule = game_schedule();
        schedule.daily_limits = DailyLimits::uniform(60);
        let apps = vec![app("game", AppCategory::Learning, Some(schedule))];
        let view = LedgerView::from_parts(vec![record("game", AppCategory::Learning, 59 * 60 + 59)], vec![]);
        let goals = GoalSettings::default();

        let decision = Evaluator::new(&apps, &view, &goals).evaluate(Some(&AppId::new("game")), at(12, 0));
        assert!(!decision.should_block);
        assert_eq!(decision.daily_limit.unwrap().used_minutes, 59);
    }

    #[test]
    fn learning_goal_and_balance() {
        let mut schedule = game_schedule();
        schedule.linked_learning_apps = vec![LinkedLearningApp::new("khan", 15)];
        let apps = vec![
            app("game", AppCategory::Reward, Some(schedule)),
            app("khan", AppCategory::Learning, None),
        ];
        let goals = GoalSettings::default();

        // Goal not met
        let view = LedgerView::from_parts(vec![record("khan", AppCategory::Learning, 10 * 60)], vec![]);
        let decision = Evaluator::new(&apps, &view, &goals).evaluate(Some(&AppId::new("game")), at(12, 0));
        assert_eq!(decision.primary_reason, Some(ReasonKind::LearningGoalNotMet));
        assert!(decision.reward_balance.is_none());

        // Goal met, all earned minutes spent
        let view = LedgerView::from_parts(
            vec![
                record("khan", AppCategory::Learning, 15 * 60),
                record("game", AppCategory::Reward, 15 * 60),
            ],
            vec![],
        );
        let decision = Evaluator::new(&apps, &view, &goals).evaluate(Some(&AppId::new("game")), at(12, 0));
        assert_eq!(decision.primary_reason, Some(ReasonKind::RewardBalanceExhausted));

        // Banked minutes keep the pool open
        let mut bank = RewardBank::empty(AppId::new("game"));
        bank.banked_minutes = 10;
        let view = LedgerView::from_parts(
            vec![
                record("khan", AppCategory::Learning, 15 * 60),
                record("game", AppCategory::Reward, 15 * 60),
            ],
            vec![bank],
        );
        let decision = Evaluator::new(&apps, &view, &goals).evaluate(Some(&AppId::new("game")), at(12, 0));
        assert!(decision.can_unlock());
        assert_eq!(decision.reward_balance.unwrap().available_minutes(), 10);
    }

    #[test]
    fn full_day_scenario() {
        let mut schedule = game_schedule();
        schedule.daily_limits = DailyLimits::uniform(60);
        schedule.linked_learning_apps = vec![LinkedLearningApp::new("khan", 15)];
        let apps = vec![
            app("game", AppCategory::Reward, Some(schedule)),
            app("khan", AppCategory::Learning, None),
        ];
        let view = LedgerView::from_parts(
            vec![
                record("khan", AppCategory::Learning, 20 * 60),
                record("game", AppCategory::Reward, 0),
            ],
            vec![],
        );

        let goals = GoalSettings::default();
        let decision = Evaluator::new(&apps, &view, &goals).evaluate(Some(&AppId::new("game")), at(15, 15));
        assert!(!decision.should_block);
        let goal = decision.goal.unwrap();
        assert!(goal.is_goal_met);
        assert_eq!(goal.current_minutes, 15);
        assert_eq!(goal.target_minutes, 15);
        assert_eq!(goal.reward_minutes_earned, 20);

        let capped = GoalSettings {
            reward_basis: RewardBasis::Capped,
            ..GoalSettings::default()
        };
        let decision = Evaluator::new(&apps, &view, &capped).evaluate(Some(&AppId::new("game")), at(15, 15));
        assert!(!decision.should_block);
        assert_eq!(decision.goal.unwrap().reward_minutes_earned, 15);
    }
}
