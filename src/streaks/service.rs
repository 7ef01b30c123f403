use chrono::{DateTime, Utc};

use crate::config::{LogSource, StreakDefaults};
use crate::db::{Database, ReadingLogEntry};
use crate::error::{AppError, Result};
use crate::streaks::cache::MetricsCache;
use crate::streaks::day;
use crate::streaks::engine::{self, StreakMetrics};
use crate::streaks::rule::{RuleRepository, RuleResolver};

/// Progress reported for today.
#[derive(Debug, Clone)]
pub struct NewLog {
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Pages read today.
    pub pages_read: u32,
    /// Minutes read today.
    pub minutes_read: u32,
    /// Percent of the book completed.
    pub percent_complete: f64,
    /// Where the progress came from.
    pub source: LogSource,
}

/// Streak evaluation wired to the log store, rule source and metrics cache.
///
/// `now` is always passed in by the caller.
#[derive(Clone)]
pub struct StreakService<R = RuleRepository, C = Database> {
    db: Database,
    rules: R,
    cache: C,
}

impl StreakService {
    /// Service using the database for rules, logs and cache.
    pub fn with_database(db: Database, defaults: StreakDefaults) -> Self {
        let rules = RuleRepository::new(db.clone(), defaults);
        Self::new(db.clone(), rules, db)
    }
}

impl<R: RuleResolver, C: MetricsCache> StreakService<R, C> {
    /// Create a service from its collaborators.
    pub fn new(db: Database, rules: R, cache: C) -> Self {
        Self { db, rules, cache }
    }

    /// Rule resolver in use.
    pub fn rules(&self) -> &R {
        &self.rules
    }

    /// Evaluate metrics without persisting them.
    ///
    /// Unknown users get empty metrics.
    pub fn evaluate(&self, user_id: &str, now: DateTime<Utc>) -> Result<StreakMetrics> {
        let rule = self.rules.resolve(user_id);

        if self.db.get_user_by_id(user_id)?.is_none() {
            tracing::debug!(user = %user_id, "Unknown user, returning empty metrics");
            return Ok(engine::empty_metrics(rule.timezone, now));
        }

        let logs = self.db.get_logs_for_user(user_id)?;
        let metrics = engine::evaluate(&logs, &rule, now);

        tracing::debug!(
            user = %user_id,
            logs = logs.len(),
            current = metrics.current_streak,
            longest = metrics.longest_streak,
            "Evaluated streak"
        );

        Ok(metrics)
    }

    /// Evaluate and store metrics. A failed cache write is returned as an error.
    pub fn refresh(&self, user_id: &str, now: DateTime<Utc>) -> Result<StreakMetrics> {
        let metrics = self.evaluate(user_id, now)?;
        self.cache.write(user_id, &metrics)?;

        tracing::info!(
            user = %user_id,
            current = metrics.current_streak,
            longest = metrics.longest_streak,
            missed = metrics.missed_days_in_window,
            "Streak metrics refreshed"
        );

        Ok(metrics)
    }

    /// Metrics for display: cached when available, evaluated otherwise.
    ///
    /// A failed cache read or write does not prevent the display.
    pub fn metrics_for_display(&self, user_id: &str, now: DateTime<Utc>) -> Result<StreakMetrics> {
        match self.cache.read(user_id) {
            Ok(Some(metrics)) => return Ok(metrics),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "Failed to read streak cache");
            }
        }

        let metrics = self.evaluate(user_id, now)?;
        self.write_through(user_id, &metrics);
        Ok(metrics)
    }

    /// Record today's progress on a book and refresh the user's metrics.
    ///
    /// Logging the same book twice on one day replaces that day's values.
    pub fn log_progress(&self, log: &NewLog, now: DateTime<Utc>) -> Result<StreakMetrics> {
        if log.book_id.trim().is_empty() {
            return Err(AppError::InvalidInput("Missing book identifier".to_string()));
        }
        if self.db.get_user_by_id(&log.user_id)?.is_none() {
            return Err(AppError::NotFound(format!("User {}", log.user_id)));
        }

        let rule = self.rules.resolve(&log.user_id);
        let today = day::local_today(rule.timezone, now);

        let entry = ReadingLogEntry {
            user_id: log.user_id.clone(),
            book_id: log.book_id.clone(),
            log_date: day::format_day(today),
            pages_read: log.pages_read,
            minutes_read: log.minutes_read,
            percent_complete: log.percent_complete.clamp(0.0, 100.0),
            source: log.source,
            updated_at: now.timestamp(),
        };
        self.db.save_log(&entry)?;

        tracing::info!(
            user = %entry.user_id,
            book = %entry.book_id,
            date = %entry.log_date,
            pages = entry.pages_read,
            minutes = entry.minutes_read,
            "Reading progress logged"
        );

        let logs = self.db.get_logs_for_user(&log.user_id)?;
        let metrics = engine::evaluate(&logs, &rule, now);
        self.write_through(&log.user_id, &metrics);
        Ok(metrics)
    }

    fn write_through(&self, user_id: &str, metrics: &StreakMetrics) {
        if let Err(e) = self.cache.write(user_id, metrics) {
            tracing::warn!(user = %user_id, error = %e, "Failed to cache streak metrics");
        }
    }
}
