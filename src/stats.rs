use crate::habits::model::{Frequency, Habit, HabitCompletion};
use crate::habits::streak;
use anyhow::{Result, bail};
use chrono::{Duration, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    #[default]
    Weekly,
    Monthly,
}

impl Timeframe {
    pub fn days(self) -> i64 {
        match self {
            Timeframe::Weekly => 7,
            Timeframe::Monthly => 28,
        }
    }

    /// First day covered by the timeframe when it ends on `today`.
    pub fn start(self, today: NaiveDate) -> NaiveDate {
        today - Duration::days(self.days() - 1)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::Weekly => f.write_str("weekly"),
            Timeframe::Monthly => f.write_str("monthly"),
        }
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "weekly" | "week" => Ok(Timeframe::Weekly),
            "monthly" | "month" => Ok(Timeframe::Monthly),
            _ => bail!("Unsupported timeframe: {raw}. Expected weekly|monthly"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    High,
    Medium,
    Low,
    VeryLow,
    None,
}

impl Tier {
    pub fn from_rate(completed: usize, total: usize) -> Self {
        if total == 0 || completed == 0 {
            return Tier::None;
        }

        let ratio = completed as f64 / total as f64;
        if ratio >= 0.8 {
            Tier::High
        } else if ratio >= 0.5 {
            Tier::Medium
        } else if ratio >= 0.3 {
            Tier::Low
        } else {
            Tier::VeryLow
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub total_habits: usize,
    pub completed_today: usize,
    pub completion_rate: u32,
    pub active_streaks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressPoint {
    pub label: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub completed: usize,
    pub total: usize,
    pub rate: u32,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HabitStatistics {
    pub habit_id: String,
    pub title: String,
    pub frequency: Frequency,
    pub completed_days: usize,
    /// Distinct cadence periods (days, weeks or months) with a completion.
    pub completed_periods: usize,
    pub tracked_periods: usize,
    pub rate: u32,
    pub stored_streak: u32,
    pub current_streak: u32,
    pub longest_streak: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsReport {
    pub timeframe: Timeframe,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub generated_at: String,
    pub summary: DashboardSummary,
    pub progress: Vec<ProgressPoint>,
    pub habits: Vec<HabitStatistics>,
}

pub fn build_report(
    timeframe: Timeframe,
    today: NaiveDate,
    habits: &[Habit],
    status: &HashMap<String, bool>,
    completions: &[HabitCompletion],
    histories: &HashMap<String, Vec<NaiveDate>>,
) -> StatisticsReport {
    StatisticsReport {
        timeframe,
        from: timeframe.start(today),
        to: today,
        generated_at: Utc::now().to_rfc3339(),
        summary: build_summary(habits, status),
        progress: build_progress(timeframe, today, habits, completions),
        habits: build_habit_statistics(timeframe, today, habits, completions, histories),
    }
}

pub fn build_summary(habits: &[Habit], status: &HashMap<String, bool>) -> DashboardSummary {
    let completed_today = habits
        .iter()
        .filter(|habit| status.get(&habit.id).copied().unwrap_or(false))
        .count();

    DashboardSummary {
        total_habits: habits.len(),
        completed_today,
        completion_rate: percent(completed_today, habits.len()),
        active_streaks: habits.iter().filter(|habit| habit.streak > 0).count(),
    }
}

/// One point per day for `weekly`, one per 7-day bucket for `monthly`, oldest
/// first. Only habits that existed at the end of a bucket count towards it.
pub fn build_progress(
    timeframe: Timeframe,
    today: NaiveDate,
    habits: &[Habit],
    completions: &[HabitCompletion],
) -> Vec<ProgressPoint> {
    let bucket_days = match timeframe {
        Timeframe::Weekly => 1,
        Timeframe::Monthly => 7,
    };
    let bucket_count = timeframe.days() / bucket_days;
    let start = timeframe.start(today);

    (0..bucket_count)
        .map(|index| {
            let from = start + Duration::days(index * bucket_days);
            let to = from + Duration::days(bucket_days - 1);

            let existing = habits
                .iter()
                .filter(|habit| created_on(habit) <= to)
                .map(|habit| habit.id.as_str())
                .collect::<HashSet<_>>();

            let completed = completions
                .iter()
                .filter(|completion| {
                    completion.completed_date >= from
                        && completion.completed_date <= to
                        && existing.contains(completion.habit_id.as_str())
                })
                .count();
            let total = existing.len() * bucket_days as usize;

            let label = match timeframe {
                Timeframe::Weekly => from.format("%a").to_string(),
                Timeframe::Monthly => format!("Week {}", index + 1),
            };

            ProgressPoint {
                label,
                from,
                to,
                completed,
                total,
                rate: percent(completed, total),
                tier: Tier::from_rate(completed, total),
            }
        })
        .collect()
}

pub fn build_habit_statistics(
    timeframe: Timeframe,
    today: NaiveDate,
    habits: &[Habit],
    completions: &[HabitCompletion],
    histories: &HashMap<String, Vec<NaiveDate>>,
) -> Vec<HabitStatistics> {
    let start = timeframe.start(today);
    let completed_by_habit = completions.iter().fold(HashMap::new(), |mut acc, completion| {
        if completion.completed_date >= start && completion.completed_date <= today {
            acc.entry(completion.habit_id.as_str())
                .or_insert_with(Vec::new)
                .push(completion.completed_date);
        }
        acc
    });

    let mut items = habits
        .iter()
        .map(|habit| {
            let dates = completed_by_habit
                .get(habit.id.as_str())
                .map(Vec::as_slice)
                .unwrap_or_default();
            let tracked_from = created_on(habit).max(start);
            let tracked_periods = (streak::period_index(habit.frequency, today)
                - streak::period_index(habit.frequency, tracked_from)
                + 1)
            .max(0) as usize;
            let completed_periods = dates
                .iter()
                .map(|date| streak::period_index(habit.frequency, *date))
                .collect::<HashSet<_>>()
                .len()
                .min(tracked_periods);
            let history = histories
                .get(&habit.id)
                .map(Vec::as_slice)
                .unwrap_or_default();

            HabitStatistics {
                habit_id: habit.id.clone(),
                title: habit.title.clone(),
                frequency: habit.frequency,
                completed_days: dates.len(),
                completed_periods,
                tracked_periods,
                rate: percent(completed_periods, tracked_periods),
                stored_streak: habit.streak,
                current_streak: streak::current_streak(habit.frequency, history, today),
                longest_streak: streak::longest_streak(habit.frequency, history, today),
            }
        })
        .collect::<Vec<_>>();

    items.sort_by(|left, right| {
        right
            .rate
            .cmp(&left.rate)
            .then_with(|| left.title.cmp(&right.title))
    });
    items
}

pub fn render_text(report: &StatisticsReport) -> String {
    let summary = &report.summary;

    let progress_rows = if report.progress.is_empty() {
        "- No data".to_string()
    } else {
        report
            .progress
            .iter()
            .map(|point| {
                format!(
                    "- {:<7} {:>3}% ({}/{})",
                    point.label, point.rate, point.completed, point.total
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let habit_rows = if report.habits.is_empty() {
        "- No habits yet".to_string()
    } else {
        report
            .habits
            .iter()
            .enumerate()
            .map(|(index, item)| {
                format!(
                    "{}. {} [{}] {}% - streak {} (history {}, best {})",
                    index + 1,
                    item.title,
                    item.frequency,
                    item.rate,
                    item.stored_streak,
                    item.current_streak,
                    item.longest_streak
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# Habit statistics ({}) - {} to {}\n\n## Today\n- Completed: {}/{} ({}%)\n- Active streaks: {}\n\n## Completion rate\n{}\n\n## By habit\n{}\n",
        report.timeframe,
        report.from,
        report.to,
        summary.completed_today,
        summary.total_habits,
        summary.completion_rate,
        summary.active_streaks,
        progress_rows,
        habit_rows
    )
}

fn created_on(habit: &Habit) -> NaiveDate {
    habit.created_at.with_timezone(&Local).date_naive()
}

fn percent(part: usize, whole: usize) -> u32 {
    if whole == 0 {
        return 0;
    }
    ((part as f64 / whole as f64) * 100.0).round() as u32
}
