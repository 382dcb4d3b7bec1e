//! End-of-day reward settlement

use chrono::NaiveDate;
use screentime_api::StreakSettings;
use screentime_store::RewardBank;

/// What settling one day did to a bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub day: NaiveDate,
    /// Earned minus used; may be negative
    pub leftover_minutes: i64,
    pub streak_days: u32,
    pub bonus_minutes: u32,
}

/// Inputs for settling one reward app's day
#[derive(Debug, Clone, Copy)]
pub struct DayResult {
    pub day: NaiveDate,
    pub earned_minutes: u32,
    pub used_minutes: u32,
    pub goal_met: bool,
}

/// Fold a finished day into a bank. Returns `None` if the day was already settled.
pub fn settle(
    bank: &RewardBank,
    result: DayResult,
    streak: Option<StreakSettings>,
) -> Option<(RewardBank, Settlement)> {
    if bank.last_settled.is_some_and(|d| d >= result.day) {
        return None;
    }

    let mut next = bank.clone();
    let leftover = i64::from(result.earned_minutes) - i64::from(result.used_minutes);
    next.banked_minutes = (next.banked_minutes + leftover).max(0);

    let mut bonus = 0;
    match streak.filter(|s| s.enabled) {
        Some(settings) => {
            let consecutive = bank
                .last_settled
                .is_none_or(|d| d.succ_opt() == Some(result.day));
            if result.goal_met {
                next.streak_days = if consecutive { bank.streak_days + 1 } else { 1 };
                let every = settings.days_required.max(1);
                if next.streak_days % every == 0 {
                    bonus = settings.bonus_minutes;
                    next.banked_minutes += i64::from(bonus);
                }
            } else {
                next.streak_days = 0;
            }
        }
        None => next.streak_days = 0,
    }

    next.last_settled = Some(result.day);
    let settlement = Settlement {
        day: result.day,
        leftover_minutes: leftover,
        streak_days: next.streak_days,
        bonus_minutes: bonus,
    };
    Some((next, settlement))
}

#[cfg(test)]
mod tests {
    use super::*;
    use screentime_util::AppId;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, d).unwrap()
    }

    fn result(d: u32, earned: u32, used: u32, goal_met: bool) -> DayResult {
        DayResult {
            day: day(d),
            earned_minutes: earned,
            used_minutes: used,
            goal_met,
        }
    }

    fn streak() -> Option<StreakSettings> {
        Some(StreakSettings {
            enabled: true,
            days_required: 3,
            bonus_minutes: 10,
        })
    }

    #[test]
    fn leftover_is_banked_and_floored() {
        let bank = RewardBank::empty(AppId::new("game"));

        let (bank, s) = settle(&bank, result(1, 20, 5, true), None).unwrap();
        assert_eq!(bank.banked_minutes, 15);
        assert_eq!(s.leftover_minutes, 15);

        let (bank, s) = settle(&bank, result(2, 0, 40, false), None).unwrap();
        assert_eq!(bank.banked_minutes, 0);
        assert_eq!(s.leftover_minutes, -40);
    }

    #[test]
    fn settles_each_day_once() {
        let bank = RewardBank::empty(AppId::new("game"));
        let (bank, _) = settle(&bank, result(1, 20, 0, true), None).unwrap();
        assert!(settle(&bank, result(1, 20, 0, true), None).is_none());
    }

    #[test]
    fn streak_bonus_every_n_days() {
        let mut bank = RewardBank::empty(AppId::new("game"));
        let mut bonuses = Vec::new();
        for d in 1..=6 {
            let (next, s) = settle(&bank, result(d, 0, 0, true), streak()).unwrap();
            bonuses.push(s.bonus_minutes);
            bank = next;
        }
        assert_eq!(bonuses, vec![0, 0, 10, 0, 0, 10]);
        assert_eq!(bank.streak_days, 6);
        assert_eq!(bank.banked_minutes, 20);
    }

    #[test]
    fn missed_goal_or_gap_resets_streak() {
        let bank = RewardBank::empty(AppId::new("game"));
        let (bank, _) = settle(&bank, result(1, 0, 0, true), streak()).unwrap();
        let (bank, _) = settle(&bank, result(2, 0, 0, true), streak()).unwrap();
        assert_eq!(bank.streak_days, 2);

        let (missed, _) = settle(&bank, result(3, 0, 0, false), streak()).unwrap();
        assert_eq!(missed.streak_days, 0);

        // Day 3 never settled
        let (gap, _) = settle(&bank, result(4, 0, 0, true), streak()).unwrap();
        assert_eq!(gap.streak_days, 1);
    }
}
