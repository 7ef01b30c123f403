//! Streak computation over a user's reading logs.
//!
//! Everything here is a pure function of its inputs: the logs, the resolved
//! rule and the reference instant. No storage is touched and no clock is
//! read, so two calls with the same inputs produce identical metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::TargetType;
use crate::db::ReadingLogEntry;
use crate::streaks::day;
use crate::streaks::rule::StreakRule;

/// Days walked when looking for the longest streak.
pub const LOOKBACK_DAYS: u64 = 365;

/// Days shown in the heatmap and counted for missed days.
pub const HEATMAP_DAYS: u64 = 30;

/// One heatmap cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeatmapDay {
    /// Calendar day in the rule's timezone.
    pub date: NaiveDate,
    /// Whether the daily target was met.
    pub success: bool,
}

/// Computed streak state of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakMetrics {
    /// Run touching today, in days.
    pub current_streak: u32,
    /// Longest run inside the lookback window, in days.
    pub longest_streak: u32,
    /// Most recent day the target was met.
    pub last_active_date: Option<NaiveDate>,
    /// Non-success days among the heatmap days.
    pub missed_days_in_window: u32,
    /// The 30 days ending today, oldest first.
    pub heatmap: Vec<HeatmapDay>,
    /// Unix timestamp of the computation.
    pub updated_at: i64,
}

impl StreakMetrics {
    /// Number of successful heatmap days.
    pub fn active_days_in_window(&self) -> usize {
        self.heatmap.iter().filter(|cell| cell.success).count()
    }
}

/// Metrics for a user without evaluable data: zero streaks and a heatmap
/// of 30 failed days ending today in `tz`.
pub fn empty_metrics(tz: Tz, now: DateTime<Utc>) -> StreakMetrics {
    let today = day::local_today(tz, now);
    let heatmap: Vec<HeatmapDay> = day::trailing_days(today, HEATMAP_DAYS)
        .map(|date| HeatmapDay {
            date,
            success: false,
        })
        .collect();

    StreakMetrics {
        current_streak: 0,
        longest_streak: 0,
        last_active_date: None,
        missed_days_in_window: heatmap.len() as u32,
        heatmap,
        updated_at: now.timestamp(),
    }
}

/// Evaluate streak metrics for one user.
///
/// `logs` may come in any order and may hold several entries per day.
/// Entries whose date cannot be parsed are skipped and logged; they count
/// neither as success nor as failure.
pub fn evaluate(logs: &[ReadingLogEntry], rule: &StreakRule, now: DateTime<Utc>) -> StreakMetrics {
    if !rule.active || logs.is_empty() {
        return empty_metrics(rule.timezone, now);
    }

    let today = day::local_today(rule.timezone, now);
    let outcomes = day_outcomes(logs, rule);

    let lookback_floor = day::days_before(today, LOOKBACK_DAYS - 1);
    let first = rule
        .start_date
        .map_or(lookback_floor, |start| start.max(lookback_floor));

    // Grace may open the walk from the start date, or from the first logged
    // day when the rule has none.
    let opening = rule
        .start_date
        .or_else(|| outcomes.keys().next().copied());

    let mut tracker = RunTracker::new(rule.grace_days);
    for date in day::days_between(first, today) {
        let success = outcomes.get(&date).copied().unwrap_or(false);
        tracker.step(success, opening.is_some_and(|open| date >= open));
    }
    let (current_streak, longest_streak) = tracker.finish();

    // Days before the floor are outside the evaluation and stay unmarked.
    let heatmap: Vec<HeatmapDay> = day::trailing_days(today, HEATMAP_DAYS)
        .map(|date| HeatmapDay {
            date,
            success: date >= first && outcomes.get(&date).copied().unwrap_or(false),
        })
        .collect();
    let missed_days_in_window = heatmap.iter().filter(|cell| !cell.success).count() as u32;

    // Not limited to the lookback: older successes still count as activity.
    let last_active_date = outcomes
        .range(..=today)
        .rev()
        .take_while(|(date, _)| rule.start_date.is_none_or(|start| **date >= start))
        .find(|(_, success)| **success)
        .map(|(date, _)| *date);

    StreakMetrics {
        current_streak,
        longest_streak,
        last_active_date,
        missed_days_in_window,
        heatmap,
        updated_at: now.timestamp(),
    }
}

/// Best values seen for one calendar day.
#[derive(Debug, Default, Clone, Copy)]
struct DayTotals {
    pages: u32,
    minutes: u32,
    percent: f64,
}

impl DayTotals {
    fn absorb(&mut self, log: &ReadingLogEntry) {
        self.pages = self.pages.max(log.pages_read);
        self.minutes = self.minutes.max(log.minutes_read);
        self.percent = self.percent.max(log.percent_complete);
    }

    fn metric(&self, target_type: TargetType) -> f64 {
        match target_type {
            TargetType::Pages => f64::from(self.pages),
            TargetType::Minutes => f64::from(self.minutes),
            TargetType::Percent => self.percent,
        }
    }
}

/// Success flag of every day that has at least one readable log.
fn day_outcomes(logs: &[ReadingLogEntry], rule: &StreakRule) -> BTreeMap<NaiveDate, bool> {
    let mut totals: BTreeMap<NaiveDate, DayTotals> = BTreeMap::new();

    for log in logs {
        let Some(date) = day::parse_log_date(&log.log_date) else {
            tracing::warn!(
                user = %log.user_id,
                book = %log.book_id,
                date = %log.log_date,
                "Skipping reading log with unparseable date"
            );
            continue;
        };
        totals.entry(date).or_default().absorb(log);
    }

    totals
        .into_iter()
        .map(|(date, day_totals)| {
            (date, day_totals.metric(rule.target_type) >= rule.target_value)
        })
        .collect()
}

/// Rolling run length with per-run grace.
///
/// A miss inside a run spends one grace day and extends the run. Grace
/// refills on the next success. Misses covered by grace only count once a
/// later success confirms them: when the run breaks, the trailing covered
/// misses are dropped from the recorded length. A run still open at the end
/// of the walk keeps them, as long as it holds at least one success.
///
/// Outside a run, grace only covers the misses that open the walk; after
/// the first break a gap cannot start a run of its own.
#[derive(Debug)]
struct RunTracker {
    grace_days: u32,
    grace_left: u32,
    run: u32,
    covered: u32,
    longest: u32,
    opening_closed: bool,
}

impl RunTracker {
    fn new(grace_days: u32) -> Self {
        Self {
            grace_days,
            grace_left: grace_days,
            run: 0,
            covered: 0,
            longest: 0,
            opening_closed: false,
        }
    }

    fn step(&mut self, success: bool, opening: bool) {
        let in_run = self.run > 0 || (opening && !self.opening_closed);

        if success {
            self.run += 1;
            self.covered = 0;
            self.grace_left = self.grace_days;
        } else if in_run && self.grace_left > 0 {
            self.grace_left -= 1;
            self.run += 1;
            self.covered += 1;
        } else {
            self.longest = self.longest.max(self.run - self.covered);
            self.run = 0;
            self.covered = 0;
            self.grace_left = self.grace_days;
            if opening {
                self.opening_closed = true;
            }
        }
    }

    /// Returns `(current, longest)`.
    fn finish(self) -> (u32, u32) {
        let current = if self.run > self.covered { self.run } else { 0 };
        (current, self.longest.max(current))
    }
}
