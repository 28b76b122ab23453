use crate::habits::model::Frequency;
use chrono::{Datelike, NaiveDate};
use std::collections::BTreeSet;

/// Index of the cadence period a date falls into: the day for daily habits,
/// the Monday-based week for weekly habits and the calendar month for monthly
/// habits. Consecutive periods have consecutive indexes.
pub fn period_index(frequency: Frequency, date: NaiveDate) -> i64 {
    match frequency {
        Frequency::Daily => i64::from(date.num_days_from_ce()),
        Frequency::Weekly => {
            let monday = i64::from(date.num_days_from_ce())
                - i64::from(date.weekday().num_days_from_monday());
            monday.div_euclid(7)
        }
        Frequency::Monthly => i64::from(date.year()) * 12 + i64::from(date.month0()),
    }
}

/// Number of consecutive periods with at least one completion, ending at the
/// current period. The previous period still counts as the end of a live
/// streak while the current one has not been completed yet.
pub fn current_streak(frequency: Frequency, dates: &[NaiveDate], today: NaiveDate) -> u32 {
    let periods = completed_periods(frequency, dates, today);
    let current = period_index(frequency, today);

    let Some(&latest) = periods.iter().next_back() else {
        return 0;
    };
    if latest != current && latest != current - 1 {
        return 0;
    }

    periods
        .iter()
        .rev()
        .zip(0_i64..)
        .take_while(|(period, offset)| **period == latest - offset)
        .count() as u32
}

/// Longest run of consecutive completed periods up to `today`.
pub fn longest_streak(frequency: Frequency, dates: &[NaiveDate], today: NaiveDate) -> u32 {
    let periods = completed_periods(frequency, dates, today);

    let (longest, _, _) = periods.iter().fold(
        (0_u32, 0_u32, None::<i64>),
        |(longest, run, previous), &period| {
            let run = match previous {
                Some(previous) if previous + 1 == period => run + 1,
                _ => 1,
            };
            (longest.max(run), run, Some(period))
        },
    );

    longest
}

fn completed_periods(frequency: Frequency, dates: &[NaiveDate], today: NaiveDate) -> BTreeSet<i64> {
    dates
        .iter()
        .filter(|date| **date <= today)
        .map(|date| period_index(frequency, *date))
        .collect()
}
