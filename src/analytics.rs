//! Reading session ingest and daily aggregation.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{AnalyticsConfig, LogSource};
use crate::db::{DailySummary, Database, ReadingEvent};
use crate::error::{AppError, Result};
use crate::streaks::cache::MetricsCache;
use crate::streaks::day;

const SECONDS_PER_DAY: i64 = 86_400;

/// Upper bound of the aggregation lookback.
pub const MAX_AGGREGATION_DAYS: u32 = 365;

/// Reading session as submitted by a reader.
#[derive(Debug, Clone)]
pub struct NewReadingEvent {
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Session start.
    pub started_at: DateTime<Utc>,
    /// Session end.
    pub ended_at: DateTime<Utc>,
    /// Pages turned.
    pub pages_delta: i64,
    /// Page at the end of the session.
    pub current_page: i64,
    /// Percent of the book completed.
    pub percent_complete: f64,
    /// Reader that produced the session.
    pub source: LogSource,
}

/// One day of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Calendar day (UTC).
    pub date: NaiveDate,
    /// Minutes read.
    pub minutes: i64,
    /// Pages read.
    pub pages: i64,
}

/// Seven-day totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyKpis {
    /// Minutes read.
    pub total_minutes: i64,
    /// Pages read.
    pub total_pages: i64,
    /// Days with any reading.
    pub active_days: usize,
    /// Current streak from the metrics cache.
    pub current_streak: u32,
}

/// Short view of a recent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Book ID.
    pub book_id: String,
    /// Session start timestamp.
    pub started_at: i64,
    /// Session end timestamp.
    pub ended_at: i64,
    /// Rounded minutes.
    pub minutes: i64,
    /// Pages turned.
    pub pages: i64,
    /// Reader that produced the session.
    pub source: LogSource,
}

/// Dashboard view of a user's recent reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    /// Seven-day totals.
    pub kpis: WeeklyKpis,
    /// Daily series, oldest first.
    pub series: Vec<SeriesPoint>,
    /// Latest sessions, newest first.
    pub sessions: Vec<SessionSummary>,
}

/// Analytics service.
#[derive(Clone)]
pub struct Analytics {
    db: Database,
    config: AnalyticsConfig,
}

impl Analytics {
    /// Create a new analytics service.
    pub fn new(db: Database, config: AnalyticsConfig) -> Self {
        Self { db, config }
    }

    /// Validate, debounce and store a reading session.
    pub fn ingest(&self, event: &NewReadingEvent) -> Result<ReadingEvent> {
        if !self.config.telemetry_enabled {
            return Err(AppError::Disabled("Reading telemetry".to_string()));
        }
        if event.book_id.trim().is_empty() || event.user_id.trim().is_empty() {
            return Err(AppError::InvalidInput("Missing user or book".to_string()));
        }
        if !self.user_opted_in(&event.user_id)? {
            return Err(AppError::Disabled(format!(
                "Reading telemetry for user {}",
                event.user_id
            )));
        }

        let started_at = event.started_at.timestamp();
        let ended_at = event.ended_at.timestamp().max(started_at);

        self.ensure_debounce(&event.user_id, &event.book_id, started_at, event.pages_delta)?;

        let stored = ReadingEvent {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: event.user_id.clone(),
            book_id: event.book_id.clone(),
            started_at,
            ended_at,
            duration: ended_at - started_at,
            pages_delta: event.pages_delta,
            current_page: event.current_page,
            percent_complete: event.percent_complete.clamp(0.0, 100.0),
            source: event.source,
        };
        self.db.save_event(&stored)?;

        tracing::debug!(
            user = %stored.user_id,
            book = %stored.book_id,
            duration = stored.duration,
            pages = stored.pages_delta,
            "Reading event stored"
        );

        Ok(stored)
    }

    /// Consent of a user, falling back to the site default when unset.
    pub fn user_opted_in(&self, user_id: &str) -> Result<bool> {
        let flag = self
            .db
            .get_user_by_id(user_id)?
            .and_then(|user| user.analytics_opt_in);
        Ok(flag.unwrap_or(self.config.default_user_opt_in))
    }

    /// Reject a session starting too soon after the previous one on the same
    /// book unless it advanced pages.
    fn ensure_debounce(
        &self,
        user_id: &str,
        book_id: &str,
        started_at: i64,
        pages_delta: i64,
    ) -> Result<()> {
        let threshold = self.config.debounce_seconds.max(0);
        if threshold == 0 && pages_delta >= 0 {
            return Ok(());
        }

        let Some(previous) = self.db.get_last_event(user_id, book_id)? else {
            return Ok(());
        };

        let gap = started_at - previous.ended_at;
        if gap < threshold && pages_delta <= 0 {
            return Err(AppError::Duplicate(format!(
                "{}s after previous event on {}",
                gap, book_id
            )));
        }
        Ok(())
    }

    /// Rebuild the summaries of one UTC day. Running it again gives the same rows.
    pub fn aggregate_date(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<Vec<DailySummary>> {
        let day_start = date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
        let day_end = day_start + SECONDS_PER_DAY - 1;
        let date_key = day::format_day(date);

        let events = self.db.get_events_overlapping(day_start, day_end)?;
        let mut totals: BTreeMap<(String, String), DailySummary> = BTreeMap::new();

        for event in events {
            if event.user_id.is_empty() || event.book_id.is_empty() {
                continue;
            }

            let duration = if event.duration > 0 {
                event.duration
            } else {
                (event.ended_at - event.started_at).max(0)
            };

            let entry = totals
                .entry((event.user_id.clone(), event.book_id.clone()))
                .or_insert_with(|| DailySummary {
                    user_id: event.user_id.clone(),
                    book_id: event.book_id.clone(),
                    date: date_key.clone(),
                    minutes: 0,
                    pages: 0,
                    last_percent: 0.0,
                });
            entry.minutes += (duration as f64 / 60.0).round() as i64;
            entry.pages += event.pages_delta;
            entry.last_percent = entry.last_percent.max(event.percent_complete);
        }

        let summaries: Vec<DailySummary> = totals.into_values().collect();
        self.db
            .replace_daily_summaries(&date_key, &summaries, now.timestamp())
            .inspect_err(|e| {
                tracing::error!(date = %date_key, error = %e, "Failed to aggregate analytics");
            })?;

        Ok(summaries)
    }

    /// Aggregate every day from `start` through `end`. Returns the number of days.
    pub fn aggregate_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut days = 0;
        for date in day::days_between(start, end) {
            self.aggregate_date(date, now)?;
            days += 1;
        }
        Ok(days)
    }

    /// Aggregate the configured lookback window ending today (UTC).
    pub fn aggregate_recent(&self, now: DateTime<Utc>) -> Result<usize> {
        let lookback = u64::from(
            self.config
                .aggregation_lookback_days
                .clamp(1, MAX_AGGREGATION_DAYS),
        );
        let today = now.date_naive();
        let days = self.aggregate_range(day::days_before(today, lookback - 1), today, now)?;
        tracing::info!(days, "Aggregated recent reading activity");
        Ok(days)
    }

    /// Daily totals of a user for the last `days` days, zero-filled.
    pub fn recent_series(
        &self,
        user_id: &str,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<SeriesPoint>> {
        let today = now.date_naive();
        let mut series: BTreeMap<NaiveDate, SeriesPoint> =
            day::trailing_days(today, u64::from(days.max(1)))
                .map(|date| {
                    let point = SeriesPoint {
                        date,
                        minutes: 0,
                        pages: 0,
                    };
                    (date, point)
                })
                .collect();

        let (Some(first), Some(last)) = (
            series.keys().next().copied(),
            series.keys().next_back().copied(),
        ) else {
            return Ok(Vec::new());
        };

        let rows = self.db.get_daily_summaries(
            user_id,
            &day::format_day(first),
            &day::format_day(last),
        )?;
        for row in rows {
            let Some(date) = day::parse_log_date(&row.date) else {
                continue;
            };
            if let Some(point) = series.get_mut(&date) {
                point.minutes += row.minutes;
                point.pages += row.pages;
            }
        }

        Ok(series.into_values().collect())
    }

    /// Totals of the last seven days plus the cached current streak.
    pub fn weekly_kpis(
        &self,
        user_id: &str,
        cache: &impl MetricsCache,
        now: DateTime<Utc>,
    ) -> Result<WeeklyKpis> {
        let today = now.date_naive();
        let start = day::days_before(today, 6);
        let rows = self.db.get_daily_summaries(
            user_id,
            &day::format_day(start),
            &day::format_day(today),
        )?;

        let mut active = BTreeSet::new();
        let mut total_minutes = 0;
        let mut total_pages = 0;
        for row in &rows {
            total_minutes += row.minutes;
            total_pages += row.pages;
            if row.minutes > 0 || row.pages > 0 {
                active.insert(row.date.as_str());
            }
        }

        let current_streak = match cache.read(user_id) {
            Ok(metrics) => metrics.map_or(0, |m| m.current_streak),
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "Failed to read streak cache");
                0
            }
        };

        Ok(WeeklyKpis {
            total_minutes,
            total_pages,
            active_days: active.len(),
            current_streak,
        })
    }

    /// KPIs, series and latest sessions of a user.
    ///
    /// Today is aggregated first so sessions not yet rolled up by the
    /// scheduler are included.
    pub fn summary(
        &self,
        user_id: &str,
        days: u32,
        cache: &impl MetricsCache,
        now: DateTime<Utc>,
    ) -> Result<UserSummary> {
        self.aggregate_date(now.date_naive(), now)?;

        Ok(UserSummary {
            kpis: self.weekly_kpis(user_id, cache, now)?,
            series: self.recent_series(user_id, days, now)?,
            sessions: self.recent_sessions(user_id, 10)?,
        })
    }

    /// Most recent sessions of a user.
    pub fn recent_sessions(&self, user_id: &str, limit: u32) -> Result<Vec<SessionSummary>> {
        let events = self.db.get_recent_events(user_id, limit)?;
        Ok(events
            .into_iter()
            .map(|event| {
                let duration = if event.duration > 0 {
                    event.duration
                } else {
                    (event.ended_at - event.started_at).max(0)
                };
                SessionSummary {
                    book_id: event.book_id,
                    started_at: event.started_at,
                    ended_at: event.ended_at,
                    minutes: (duration as f64 / 60.0).round() as i64,
                    pages: event.pages_delta,
                    source: event.source,
                }
            })
            .collect())
    }
}
