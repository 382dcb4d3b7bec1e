//! Human-readable summaries of weekly windows

use chrono::Weekday;
use screentime_api::{DayWindow, WeeklyWindows};
use screentime_util::{WEEK, weekday_short};

/// Summarize the allowed windows of a week.
///
/// Uniform weeks collapse to "Every day", a week that only differs between
/// weekdays and weekends becomes two groups, and anything else lists runs
/// of consecutive days sharing a window.
pub fn week_summary(windows: &WeeklyWindows) -> String {
    let days = windows.as_array();

    if days.iter().all(|w| *w == days[0]) {
        return format!("Every day: {}", days[0]);
    }

    let weekdays = &days[0..5];
    let weekend = &days[5..7];
    if weekdays.iter().all(|w| *w == weekdays[0]) && weekend[0] == weekend[1] {
        return format!("Weekdays: {}; Weekends: {}", weekdays[0], weekend[0]);
    }

    runs(days)
        .into_iter()
        .map(|(first, last, window)| {
            if first == last {
                format!("{}: {}", weekday_short(first), window)
            } else {
                format!("{}-{}: {}", weekday_short(first), weekday_short(last), window)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn runs(days: &[DayWindow; 7]) -> Vec<(Weekday, Weekday, DayWindow)> {
    let mut runs: Vec<(Weekday, Weekday, DayWindow)> = Vec::new();
    for (i, window) in days.iter().enumerate() {
        match runs.last_mut() {
            Some((_, last, current)) if current == window => *last = WEEK[i],
            _ => runs.push((WEEK[i], WEEK[i], *window)),
        }
    }
    runs
}
