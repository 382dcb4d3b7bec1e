//! Usage ledger: authoritative per-app counters with day rollover

use chrono::{DateTime, Local, NaiveDate};
use screentime_config::AppEntry;
use screentime_store::{AppUsageRecord, DailySummary, Store};
use screentime_util::AppId;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{CoreError, CoreResult};

/// Ledger operations over the store
pub struct Ledger {
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Load the record for a configured app, creating it on first sight
    pub fn ensure_record(&self, app: &AppEntry, now: DateTime<Local>) -> CoreResult<AppUsageRecord> {
        if let Some(mut record) = self.store.load_record(&app.id)? {
            if record.display_name != app.label
                || record.category != app.category
                || record.reward_points_per_minute != app.reward_points_per_minute
            {
                record.display_name = app.label.clone();
                record.category = app.category;
                record.reward_points_per_minute = app.reward_points_per_minute;
                self.store.save_record(&record)?;
            }
            return Ok(record);
        }

        let record = AppUsageRecord::new(
            app.id.clone(),
            app.label.clone(),
            app.category,
            app.reward_points_per_minute,
            now,
        );
        self.store.save_record(&record)?;
        info!(app_id = %app.id, category = %app.category, "Usage record created");
        Ok(record)
    }

    pub fn record(&self, app_id: &AppId) -> CoreResult<Option<AppUsageRecord>> {
        Ok(self.store.load_record(app_id)?)
    }

    /// Credit validated, non-duplicate usage to an app
    pub fn apply_increment(
        &self,
        app_id: &AppId,
        delta_seconds: u64,
        reward_rate: u32,
        at: DateTime<Local>,
    ) -> CoreResult<AppUsageRecord> {
        let mut record = self
            .store
            .load_record(app_id)?
            .ok_or_else(|| CoreError::AppNotFound(app_id.clone()))?;

        if !credit(&mut record, delta_seconds, reward_rate, at) {
            debug!(app_id = %app_id, at = %at, "Credit for a completed day ignored");
            return Ok(record);
        }
        self.store.save_record(&record)?;

        debug!(
            app_id = %app_id,
            delta_secs = delta_seconds,
            today_secs = record.today_seconds,
            total_secs = record.total_seconds,
            "Usage credited"
        );
        Ok(record)
    }

    /// Delete an app's record and counters. Returns false if there was none.
    pub fn forget(&self, app_id: &AppId) -> CoreResult<bool> {
        if self.store.load_record(app_id)?.is_none() {
            return Ok(false);
        }
        self.store.delete_record(app_id)?;
        info!(app_id = %app_id, "Usage record deleted");
        Ok(true)
    }

    /// Roll every record whose day is before `today`. Returns how many rolled.
    pub fn reset_daily_counters(&self, today: NaiveDate) -> CoreResult<usize> {
        let mut rolled = 0;
        for mut record in self.store.list_records()? {
            if roll_over(&mut record, today) {
                self.store.save_record(&record)?;
                rolled += 1;
            }
        }
        if rolled > 0 {
            info!(rolled, day = %today, "Daily counters reset");
        }
        Ok(rolled)
    }
}

/// Move the record's current day into history if `today` is later.
pub fn roll_over(record: &mut AppUsageRecord, today: NaiveDate) -> bool {
    if record.last_reset_date >= today {
        return false;
    }

    let date = record.last_reset_date;
    if record.history_for(date).is_none() {
        record.daily_history.push(DailySummary {
            date,
            seconds: record.today_seconds,
            points: record.today_points,
        });
    }

    record.today_seconds = 0;
    record.today_points = 0;
    record.last_reset_date = today;
    true
}

/// Add `delta_seconds` at `at`, rolling the day first when needed.
///
/// Completed days are closed: returns false and leaves the record untouched
/// when `at` falls before its current day.
pub fn credit(record: &mut AppUsageRecord, delta_seconds: u64, reward_rate: u32, at: DateTime<Local>) -> bool {
    let day = at.date_naive();
    if day < record.last_reset_date {
        return false;
    }
    roll_over(record, day);

    let before = record.today_seconds;
    let after = before.saturating_add(delta_seconds);
    let points = points_between(before, after, u64::from(reward_rate));

    record.today_seconds = after;
    record.today_points = record.today_points.saturating_add(points);
    record.total_seconds = record.total_seconds.saturating_add(delta_seconds);
    record.earned_points = record.earned_points.saturating_add(points);

    if at > record.updated_at {
        record.updated_at = at;
    }
    true
}

/// Points for the whole minutes crossed going from `before` to `after` seconds
pub fn points_between(before: u64, after: u64, rate: u64) -> u64 {
    (after / 60 * rate).saturating_sub(before / 60 * rate)
}

/// Seconds used on `day`
pub fn seconds_on(record: &AppUsageRecord, day: NaiveDate) -> u64 {
    if day == record.last_reset_date {
        record.today_seconds
    } else if day < record.last_reset_date {
        record.history_for(day).map(|s| s.seconds).unwrap_or(0)
    } else {
        0
    }
}

/// Whole minutes used on `day`
pub fn minutes_on(record: &AppUsageRecord, day: NaiveDate) -> u32 {
    u32::try_from(seconds_on(record, day) / 60).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use screentime_api::AppCategory;
    use screentime_store::SqliteStore;

    fn yesterday() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 12, 28, 18, 0, 0).unwrap()
    }

    fn today() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 12, 29, 9, 0, 0).unwrap()
    }

    fn record_at(at: DateTime<Local>) -> AppUsageRecord {
        AppUsageRecord::new(AppId::new("khan"), "Khan Academy", AppCategory::Learning, 2, at)
    }

    #[test]
    fn day_rollover_moves_yesterday_to_history() {
        let mut record = record_at(yesterday());
        credit(&mut record, 600, 2, yesterday());
        assert_eq!(record.today_seconds, 600);
        assert_eq!(record.today_points, 20);

        credit(&mut record, 60, 2, today());

        assert_eq!(record.today_seconds, 60);
        assert_eq!(record.total_seconds, 660);
        assert_eq!(record.last_reset_date, today().date_naive());
        assert_eq!(record.daily_history.len(), 1);
        assert_eq!(record.daily_history[0].seconds, 600);
        assert_eq!(record.daily_history[0].date, yesterday().date_naive());
        assert!(record.history_for(today().date_naive()).is_none());
    }

    #[test]
    fn rollover_never_duplicates_history() {
        let mut record = record_at(yesterday());
        credit(&mut record, 120, 1, yesterday());

        assert!(roll_over(&mut record, today().date_naive()));
        assert!(!roll_over(&mut record, today().date_naive()));
        assert_eq!(record.daily_history.len(), 1);
    }

    #[test]
    fn points_carry_partial_minutes() {
        let mut record = record_at(today());
        credit(&mut record, 30, 2, today());
        assert_eq!(record.today_points, 0);
        credit(&mut record, 30, 2, today());
        assert_eq!(record.today_points, 2);
        credit(&mut record, 60, 2, today());
        assert_eq!(record.today_points, 4);
        assert_eq!(record.earned_points, 4);
    }

    #[test]
    fn completed_day_is_closed() {
        let mut record = record_at(yesterday());
        assert!(credit(&mut record, 60, 1, yesterday()));
        assert!(credit(&mut record, 60, 1, today()));

        let before = record.clone();
        assert!(!credit(&mut record, 120, 1, yesterday() + ChronoDuration::minutes(5)));
        assert_eq!(record, before);
        assert_eq!(seconds_on(&record, yesterday().date_naive()), 60);
    }

    #[test]
    fn seconds_on_unrolled_record() {
        let record = {
            let mut r = record_at(yesterday());
            credit(&mut r, 300, 1, yesterday());
            r
        };
        // Not rolled yet: nothing used today
        assert_eq!(seconds_on(&record, today().date_naive()), 0);
        assert_eq!(minutes_on(&record, yesterday().date_naive()), 5);
    }

    #[test]
    fn ledger_persists_and_resets() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let ledger = Ledger::new(store.clone());
        let app = AppEntry {
            id: AppId::new("khan"),
            label: "Khan Academy".into(),
            category: AppCategory::Learning,
            tokens: vec![],
            reward_points_per_minute: 1,
            schedule: None,
        };

        ledger.ensure_record(&app, yesterday()).unwrap();
        ledger.apply_increment(&app.id, 600, 1, yesterday()).unwrap();

        assert_eq!(ledger.reset_daily_counters(today().date_naive()).unwrap(), 1);
        assert_eq!(ledger.reset_daily_counters(today().date_naive()).unwrap(), 0);

        let record = ledger.record(&app.id).unwrap().unwrap();
        assert_eq!(record.today_seconds, 0);
        assert_eq!(record.total_seconds, 600);
        assert_eq!(store.kv_get("usage_khan_today").unwrap().as_deref(), Some("0"));
    }

    #[test]
    fn forget_removes_record_once() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let ledger = Ledger::new(store.clone());
        let app = AppEntry {
            id: AppId::new("khan"),
            label: "Khan Academy".into(),
            category: AppCategory::Learning,
            tokens: vec![],
            reward_points_per_minute: 1,
            schedule: None,
        };
        ledger.ensure_record(&app, today()).unwrap();

        assert!(ledger.forget(&app.id).unwrap());
        assert!(!ledger.forget(&app.id).unwrap());
        assert!(store.kv_get("usage_khan_total").unwrap().is_none());
    }

    #[test]
    fn increment_unknown_app_fails() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let ledger = Ledger::new(store);
        let result = ledger.apply_increment(&AppId::new("nope"), 60, 1, today());
        assert!(matches!(result, Err(CoreError::AppNotFound(_))));
    }
}
