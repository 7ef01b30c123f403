mod schema;

pub use schema::Database;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::LogSource;

/// User known to the streak tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID.
    pub id: String,
    /// Display name.
    pub name: Option<String>,
    /// IANA timezone from the user's profile.
    pub timezone: Option<String>,
    /// Reading telemetry consent; `None` follows the site default.
    pub analytics_opt_in: Option<bool>,
    /// Account creation timestamp.
    pub created_at: i64,
}

/// One day of reading on one book.
///
/// `log_date` is kept as stored text. It has no time component and is
/// parsed by the streak engine, which skips values it cannot read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingLogEntry {
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Calendar day (`YYYY-MM-DD`).
    pub log_date: String,
    /// Pages read that day.
    pub pages_read: u32,
    /// Minutes read that day.
    pub minutes_read: u32,
    /// Percent of the book completed (0.0 - 100.0).
    pub percent_complete: f64,
    /// Where the progress came from.
    pub source: LogSource,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Persisted per-user streak rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRule {
    /// Rule key (`user_<id>`).
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Target type name.
    pub daily_target_type: String,
    /// Daily target value.
    pub daily_target_value: f64,
    /// Grace days.
    pub grace_days: u32,
    /// IANA timezone (empty falls back to the user's timezone).
    pub timezone: Option<String>,
    /// Evaluation floor (`YYYY-MM-DD`).
    pub start_date: Option<String>,
    /// Whether the rule takes part in evaluation.
    pub active: bool,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Cached streak metrics row.
#[derive(Debug, Clone)]
pub struct StreakCacheRow {
    /// User ID.
    pub user_id: String,
    /// Current streak in days.
    pub current_streak: u32,
    /// Longest streak in days.
    pub longest_streak: u32,
    /// Most recent successful day (`YYYY-MM-DD`).
    pub last_active: Option<String>,
    /// Failed days in the trailing window.
    pub missed_days_window: u32,
    /// Heatmap cells as JSON.
    pub heatmap_json: String,
    /// Computation timestamp.
    pub updated_at: i64,
}

/// Pending streak re-evaluation.
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// Queue row ID.
    pub id: i64,
    /// User to re-evaluate.
    pub user_id: String,
    /// Deliveries so far.
    pub attempts: u32,
    /// Earliest delivery timestamp.
    pub available_at: i64,
    /// Error of the last failed delivery.
    pub last_error: Option<String>,
}

/// Reading session reported by a reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingEvent {
    /// Event ID.
    pub id: String,
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Session start timestamp.
    pub started_at: i64,
    /// Session end timestamp.
    pub ended_at: i64,
    /// Session length in seconds.
    pub duration: i64,
    /// Pages turned.
    pub pages_delta: i64,
    /// Page at the end of the session.
    pub current_page: i64,
    /// Percent of the book completed.
    pub percent_complete: f64,
    /// Reader that produced the event.
    pub source: LogSource,
}

/// Aggregated reading for one user, book and UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Calendar day (`YYYY-MM-DD`).
    pub date: String,
    /// Minutes read.
    pub minutes: i64,
    /// Pages read.
    pub pages: i64,
    /// Highest percent seen that day.
    pub last_percent: f64,
}

/// Timestamp helper.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}
