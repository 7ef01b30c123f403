//! Last computed metrics per user.
//!
//! The cache is not the source of truth: every entry can be rebuilt by
//! evaluating the user's logs again, so an unreadable entry is a miss.

use crate::db::{Database, StreakCacheRow};
use crate::error::Result;
use crate::streaks::day;
use crate::streaks::engine::{HeatmapDay, StreakMetrics};

/// Storage for computed streak metrics.
pub trait MetricsCache: Send + Sync {
    /// Cached metrics of `user_id`, if any were computed.
    fn read(&self, user_id: &str) -> Result<Option<StreakMetrics>>;

    /// Store metrics for `user_id`, replacing any previous entry.
    fn write(&self, user_id: &str, metrics: &StreakMetrics) -> Result<()>;
}

impl MetricsCache for Database {
    fn read(&self, user_id: &str) -> Result<Option<StreakMetrics>> {
        let Some(row) = self.get_streak_cache(user_id)? else {
            return Ok(None);
        };

        let heatmap: Vec<HeatmapDay> = match serde_json::from_str(&row.heatmap_json) {
            Ok(heatmap) => heatmap,
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "Discarding unreadable cached heatmap");
                return Ok(None);
            }
        };

        let last_active_date = match row.last_active.as_deref() {
            Some(raw) => match day::parse_log_date(raw) {
                Some(date) => Some(date),
                None => {
                    tracing::warn!(user = %user_id, last_active = %raw, "Discarding unreadable cache entry");
                    return Ok(None);
                }
            },
            None => None,
        };

        Ok(Some(StreakMetrics {
            current_streak: row.current_streak,
            longest_streak: row.longest_streak,
            last_active_date,
            missed_days_in_window: row.missed_days_window,
            heatmap,
            updated_at: row.updated_at,
        }))
    }

    fn write(&self, user_id: &str, metrics: &StreakMetrics) -> Result<()> {
        let row = StreakCacheRow {
            user_id: user_id.to_string(),
            current_streak: metrics.current_streak,
            longest_streak: metrics.longest_streak,
            last_active: metrics.last_active_date.map(day::format_day),
            missed_days_window: metrics.missed_days_in_window,
            heatmap_json: serde_json::to_string(&metrics.heatmap)?,
            updated_at: metrics.updated_at,
        };
        self.save_streak_cache(&row)
    }
}
