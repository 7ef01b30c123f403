use crate::config::LogSource;
use crate::db::*;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Database(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Database(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Users table
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT,
                timezone TEXT,
                analytics_opt_in INTEGER,
                created_at INTEGER NOT NULL
            );

            -- Reading logs: one row per user, book and day
            CREATE TABLE IF NOT EXISTS reading_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                log_date TEXT NOT NULL,
                pages_read INTEGER NOT NULL DEFAULT 0,
                minutes_read INTEGER NOT NULL DEFAULT 0,
                percent_complete REAL NOT NULL DEFAULT 0,
                source TEXT NOT NULL DEFAULT 'manual',
                updated_at INTEGER NOT NULL,
                UNIQUE (user_id, book_id, log_date)
            );

            -- Streak rules keyed by user_<id>
            CREATE TABLE IF NOT EXISTS streak_rules (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                daily_target_type TEXT NOT NULL DEFAULT 'pages',
                daily_target_value REAL NOT NULL DEFAULT 0,
                grace_days INTEGER NOT NULL DEFAULT 0,
                timezone TEXT,
                start_date TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL
            );

            -- Last computed streak metrics
            CREATE TABLE IF NOT EXISTS streak_cache (
                user_id TEXT PRIMARY KEY,
                current_streak INTEGER NOT NULL DEFAULT 0,
                longest_streak INTEGER NOT NULL DEFAULT 0,
                last_active TEXT,
                missed_days_window INTEGER NOT NULL DEFAULT 0,
                heatmap_json TEXT NOT NULL DEFAULT '[]',
                updated_at INTEGER NOT NULL
            );

            -- Pending streak re-evaluations
            CREATE TABLE IF NOT EXISTS streak_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT UNIQUE NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                available_at INTEGER NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL
            );

            -- Raw reading sessions
            CREATE TABLE IF NOT EXISTS reading_events (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER NOT NULL,
                duration INTEGER NOT NULL DEFAULT 0,
                pages_delta INTEGER NOT NULL DEFAULT 0,
                current_page INTEGER NOT NULL DEFAULT 0,
                percent_complete REAL NOT NULL DEFAULT 0,
                source TEXT NOT NULL DEFAULT 'manual'
            );

            -- Daily reading summaries
            CREATE TABLE IF NOT EXISTS analytics_daily (
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                date TEXT NOT NULL,
                minutes INTEGER NOT NULL DEFAULT 0,
                pages INTEGER NOT NULL DEFAULT 0,
                last_percent REAL NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, book_id, date)
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_reading_logs_user ON reading_logs(user_id, log_date);
            CREATE INDEX IF NOT EXISTS idx_streak_rules_user ON streak_rules(user_id);
            CREATE INDEX IF NOT EXISTS idx_streak_queue_due ON streak_queue(available_at);
            CREATE INDEX IF NOT EXISTS idx_reading_events_user_book ON reading_events(user_id, book_id, ended_at);
            CREATE INDEX IF NOT EXISTS idx_reading_events_span ON reading_events(started_at, ended_at);
            CREATE INDEX IF NOT EXISTS idx_analytics_daily_user ON analytics_daily(user_id, date);
            "#,
        )
        .map_err(|e| AppError::Database(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    // ========== USER OPERATIONS ==========

    /// Create a new user.
    pub fn create_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, name, timezone, analytics_opt_in, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id,
                user.name,
                user.timezone,
                user.analytics_opt_in,
                user.created_at
            ],
        )
        .map_err(|e| AppError::Database(format!("Failed to create user: {}", e)))?;
        Ok(())
    }

    /// Get user by ID.
    pub fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, timezone, analytics_opt_in, created_at FROM users WHERE id = ?1",
            params![id],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Database(format!("Failed to get user: {}", e)))
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, timezone, analytics_opt_in, created_at FROM users ORDER BY id",
            )
            .map_err(|e| AppError::Database(format!("Failed to prepare query: {}", e)))?;

        let users = stmt
            .query_map([], Self::row_to_user)
            .map_err(|e| AppError::Database(format!("Failed to list users: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Database(format!("Failed to collect users: {}", e)))?;

        Ok(users)
    }

    /// Set or clear a user's analytics opt-in. Returns false for unknown users.
    pub fn set_user_opt_in(&self, id: &str, opt_in: Option<bool>) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET analytics_opt_in = ?1 WHERE id = ?2",
                params![opt_in, id],
            )
            .map_err(|e| AppError::Database(format!("Failed to update user: {}", e)))?;
        Ok(rows > 0)
    }

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            name: row.get(1)?,
            timezone: row.get(2)?,
            analytics_opt_in: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    /// Delete a user.
    pub fn delete_user(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM users WHERE id = ?1", params![id])
            .map_err(|e| AppError::Database(format!("Failed to delete user: {}", e)))?;
        Ok(rows > 0)
    }

    // ========== READING LOG OPERATIONS ==========

    /// Save a day's log, replacing the values of an existing entry for the same day.
    pub fn save_log(&self, log: &ReadingLogEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reading_logs
             (user_id, book_id, log_date, pages_read, minutes_read, percent_complete, source, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (user_id, book_id, log_date) DO UPDATE SET
                pages_read = excluded.pages_read,
                minutes_read = excluded.minutes_read,
                percent_complete = excluded.percent_complete,
                source = excluded.source,
                updated_at = excluded.updated_at",
            params![
                log.user_id,
                log.book_id,
                log.log_date,
                log.pages_read,
                log.minutes_read,
                log.percent_complete,
                log.source.as_str(),
                log.updated_at,
            ],
        )
        .map_err(|e| AppError::Database(format!("Failed to save reading log: {}", e)))?;
        Ok(())
    }

    /// Get all logs of a user, oldest day first.
    pub fn get_logs_for_user(&self, user_id: &str) -> Result<Vec<ReadingLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT user_id, book_id, log_date, pages_read, minutes_read,
                        percent_complete, source, updated_at
                 FROM reading_logs WHERE user_id = ?1
                 ORDER BY log_date ASC, book_id ASC",
            )
            .map_err(|e| AppError::Database(format!("Failed to prepare query: {}", e)))?;

        let logs = stmt
            .query_map(params![user_id], |row| {
                let source: String = row.get(6)?;
                Ok(ReadingLogEntry {
                    user_id: row.get(0)?,
                    book_id: row.get(1)?,
                    log_date: row.get(2)?,
                    pages_read: row.get(3)?,
                    minutes_read: row.get(4)?,
                    percent_complete: row.get(5)?,
                    source: LogSource::sanitize(&source),
                    updated_at: row.get(7)?,
                })
            })
            .map_err(|e| AppError::Database(format!("Failed to get reading logs: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Database(format!("Failed to collect reading logs: {}", e)))?;

        Ok(logs)
    }

    // ========== STREAK RULE OPERATIONS ==========

    /// Save or replace a streak rule.
    pub fn save_rule(&self, rule: &StoredRule) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO streak_rules
             (id, user_id, daily_target_type, daily_target_value, grace_days,
              timezone, start_date, active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (id) DO UPDATE SET
                user_id = excluded.user_id,
                daily_target_type = excluded.daily_target_type,
                daily_target_value = excluded.daily_target_value,
                grace_days = excluded.grace_days,
                timezone = excluded.timezone,
                start_date = excluded.start_date,
                active = excluded.active,
                updated_at = excluded.updated_at",
            params![
                rule.id,
                rule.user_id,
                rule.daily_target_type,
                rule.daily_target_value,
                rule.grace_days,
                rule.timezone,
                rule.start_date,
                rule.active,
                rule.updated_at,
            ],
        )
        .map_err(|e| AppError::Database(format!("Failed to save streak rule: {}", e)))?;
        Ok(())
    }

    /// Get a streak rule by key.
    pub fn get_rule(&self, id: &str) -> Result<Option<StoredRule>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, daily_target_type, daily_target_value, grace_days,
                    timezone, start_date, active, updated_at
             FROM streak_rules WHERE id = ?1",
            params![id],
            Self::row_to_rule,
        )
        .optional()
        .map_err(|e| AppError::Database(format!("Failed to get streak rule: {}", e)))
    }

    /// List all stored rules.
    pub fn list_rules(&self) -> Result<Vec<StoredRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, daily_target_type, daily_target_value, grace_days,
                        timezone, start_date, active, updated_at
                 FROM streak_rules ORDER BY id",
            )
            .map_err(|e| AppError::Database(format!("Failed to prepare query: {}", e)))?;

        let rules = stmt
            .query_map([], Self::row_to_rule)
            .map_err(|e| AppError::Database(format!("Failed to list streak rules: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Database(format!("Failed to collect streak rules: {}", e)))?;

        Ok(rules)
    }

    /// User IDs of all active per-user rules.
    pub fn list_active_rule_users(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT user_id FROM streak_rules
                 WHERE active = 1 AND user_id != '' ORDER BY user_id",
            )
            .map_err(|e| AppError::Database(format!("Failed to prepare query: {}", e)))?;

        let users = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| AppError::Database(format!("Failed to list rule users: {}", e)))?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(|e| AppError::Database(format!("Failed to collect rule users: {}", e)))?;

        Ok(users)
    }

    /// Delete a streak rule.
    pub fn delete_rule(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM streak_rules WHERE id = ?1", params![id])
            .map_err(|e| AppError::Database(format!("Failed to delete streak rule: {}", e)))?;
        Ok(rows > 0)
    }

    fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRule> {
        Ok(StoredRule {
            id: row.get(0)?,
            user_id: row.get(1)?,
            daily_target_type: row.get(2)?,
            daily_target_value: row.get(3)?,
            grace_days: row.get(4)?,
            timezone: row.get(5)?,
            start_date: row.get(6)?,
            active: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    // ========== STREAK CACHE OPERATIONS ==========

    /// Save or overwrite the cached metrics of a user.
    pub fn save_streak_cache(&self, row: &StreakCacheRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO streak_cache
             (user_id, current_streak, longest_streak, last_active, missed_days_window,
              heatmap_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (user_id) DO UPDATE SET
                current_streak = excluded.current_streak,
                longest_streak = excluded.longest_streak,
                last_active = excluded.last_active,
                missed_days_window = excluded.missed_days_window,
                heatmap_json = excluded.heatmap_json,
                updated_at = excluded.updated_at",
            params![
                row.user_id,
                row.current_streak,
                row.longest_streak,
                row.last_active,
                row.missed_days_window,
                row.heatmap_json,
                row.updated_at,
            ],
        )
        .map_err(|e| AppError::Database(format!("Failed to save streak cache: {}", e)))?;
        Ok(())
    }

    /// Get the cached metrics of a user.
    pub fn get_streak_cache(&self, user_id: &str) -> Result<Option<StreakCacheRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, current_streak, longest_streak, last_active, missed_days_window,
                    heatmap_json, updated_at
             FROM streak_cache WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(StreakCacheRow {
                    user_id: row.get(0)?,
                    current_streak: row.get(1)?,
                    longest_streak: row.get(2)?,
                    last_active: row.get(3)?,
                    missed_days_window: row.get(4)?,
                    heatmap_json: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::Database(format!("Failed to get streak cache: {}", e)))
    }

    /// Drop the cached metrics of a user.
    pub fn delete_streak_cache(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM streak_cache WHERE user_id = ?1",
                params![user_id],
            )
            .map_err(|e| AppError::Database(format!("Failed to delete streak cache: {}", e)))?;
        Ok(rows > 0)
    }

    // ========== QUEUE OPERATIONS ==========

    /// Queue a user for re-evaluation. Returns false if one is already pending.
    pub fn enqueue_streak_eval(&self, user_id: &str, now: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "INSERT INTO streak_queue (user_id, attempts, available_at, created_at)
                 VALUES (?1, 0, ?2, ?2)
                 ON CONFLICT (user_id) DO NOTHING",
                params![user_id, now],
            )
            .map_err(|e| AppError::Database(format!("Failed to enqueue user: {}", e)))?;
        Ok(rows > 0)
    }

    /// Claim due items, hiding them from other claimers until `lease_until`.
    pub fn claim_due_items(&self, now: i64, limit: u32, lease_until: i64) -> Result<Vec<QueueItem>> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Database(format!("Failed to start transaction: {}", e)))?;

        let items = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, user_id, attempts, available_at, last_error
                     FROM streak_queue WHERE available_at <= ?1
                     ORDER BY available_at ASC, id ASC LIMIT ?2",
                )
                .map_err(|e| AppError::Database(format!("Failed to prepare query: {}", e)))?;

            let claimed = stmt
                .query_map(params![now, limit], |row| {
                    Ok(QueueItem {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        attempts: row.get(2)?,
                        available_at: row.get(3)?,
                        last_error: row.get(4)?,
                    })
                })
                .map_err(|e| AppError::Database(format!("Failed to claim queue items: {}", e)))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| AppError::Database(format!("Failed to collect queue items: {}", e)))?;
            claimed
        };

        for item in &items {
            tx.execute(
                "UPDATE streak_queue SET available_at = ?1 WHERE id = ?2",
                params![lease_until, item.id],
            )
            .map_err(|e| AppError::Database(format!("Failed to lease queue item: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| AppError::Database(format!("Failed to commit claim: {}", e)))?;

        Ok(items)
    }

    /// Remove a finished or abandoned item.
    pub fn delete_queue_item(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM streak_queue WHERE id = ?1", params![id])
            .map_err(|e| AppError::Database(format!("Failed to delete queue item: {}", e)))?;
        Ok(rows > 0)
    }

    /// Put a failed item back for a later delivery.
    pub fn release_queue_item(
        &self,
        id: i64,
        attempts: u32,
        available_at: i64,
        error: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE streak_queue SET attempts = ?1, available_at = ?2, last_error = ?3
             WHERE id = ?4",
            params![attempts, available_at, error, id],
        )
        .map_err(|e| AppError::Database(format!("Failed to release queue item: {}", e)))?;
        Ok(())
    }

    /// List pending items.
    pub fn list_queue(&self) -> Result<Vec<QueueItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, attempts, available_at, last_error
                 FROM streak_queue ORDER BY available_at ASC, id ASC",
            )
            .map_err(|e| AppError::Database(format!("Failed to prepare query: {}", e)))?;

        let items = stmt
            .query_map([], |row| {
                Ok(QueueItem {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    attempts: row.get(2)?,
                    available_at: row.get(3)?,
                    last_error: row.get(4)?,
                })
            })
            .map_err(|e| AppError::Database(format!("Failed to list queue: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Database(format!("Failed to collect queue: {}", e)))?;

        Ok(items)
    }

    // ========== ANALYTICS OPERATIONS ==========

    /// Store a reading event.
    pub fn save_event(&self, event: &ReadingEvent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reading_events
             (id, user_id, book_id, started_at, ended_at, duration, pages_delta,
              current_page, percent_complete, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.id,
                event.user_id,
                event.book_id,
                event.started_at,
                event.ended_at,
                event.duration,
                event.pages_delta,
                event.current_page,
                event.percent_complete,
                event.source.as_str(),
            ],
        )
        .map_err(|e| AppError::Database(format!("Failed to save reading event: {}", e)))?;
        Ok(())
    }

    /// Latest event of a user on a book.
    pub fn get_last_event(&self, user_id: &str, book_id: &str) -> Result<Option<ReadingEvent>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, book_id, started_at, ended_at, duration, pages_delta,
                    current_page, percent_complete, source
             FROM reading_events WHERE user_id = ?1 AND book_id = ?2
             ORDER BY ended_at DESC LIMIT 1",
            params![user_id, book_id],
            Self::row_to_event,
        )
        .optional()
        .map_err(|e| AppError::Database(format!("Failed to get last event: {}", e)))
    }

    /// Events whose span overlaps `[start, end]`.
    pub fn get_events_overlapping(&self, start: i64, end: i64) -> Result<Vec<ReadingEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, book_id, started_at, ended_at, duration, pages_delta,
                        current_page, percent_complete, source
                 FROM reading_events WHERE started_at <= ?2 AND ended_at >= ?1
                 ORDER BY started_at ASC",
            )
            .map_err(|e| AppError::Database(format!("Failed to prepare query: {}", e)))?;

        let events = stmt
            .query_map(params![start, end], Self::row_to_event)
            .map_err(|e| AppError::Database(format!("Failed to get events: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Database(format!("Failed to collect events: {}", e)))?;

        Ok(events)
    }

    /// Most recent events of a user.
    pub fn get_recent_events(&self, user_id: &str, limit: u32) -> Result<Vec<ReadingEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, book_id, started_at, ended_at, duration, pages_delta,
                        current_page, percent_complete, source
                 FROM reading_events WHERE user_id = ?1
                 ORDER BY ended_at DESC LIMIT ?2",
            )
            .map_err(|e| AppError::Database(format!("Failed to prepare query: {}", e)))?;

        let events = stmt
            .query_map(params![user_id, limit], Self::row_to_event)
            .map_err(|e| AppError::Database(format!("Failed to get recent events: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Database(format!("Failed to collect events: {}", e)))?;

        Ok(events)
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReadingEvent> {
        let source: String = row.get(9)?;
        Ok(ReadingEvent {
            id: row.get(0)?,
            user_id: row.get(1)?,
            book_id: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            duration: row.get(5)?,
            pages_delta: row.get(6)?,
            current_page: row.get(7)?,
            percent_complete: row.get(8)?,
            source: LogSource::sanitize(&source),
        })
    }

    /// Replace every summary of a day in one transaction.
    pub fn replace_daily_summaries(
        &self,
        date: &str,
        summaries: &[DailySummary],
        updated_at: i64,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Database(format!("Failed to start transaction: {}", e)))?;

        tx.execute("DELETE FROM analytics_daily WHERE date = ?1", params![date])
            .map_err(|e| AppError::Database(format!("Failed to clear daily summaries: {}", e)))?;

        for summary in summaries {
            tx.execute(
                "INSERT INTO analytics_daily
                 (user_id, book_id, date, minutes, pages, last_percent, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    summary.user_id,
                    summary.book_id,
                    date,
                    summary.minutes,
                    summary.pages,
                    summary.last_percent,
                    updated_at,
                ],
            )
            .map_err(|e| AppError::Database(format!("Failed to save daily summary: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| AppError::Database(format!("Failed to commit daily summaries: {}", e)))?;
        Ok(())
    }

    /// Summaries of a user between two days (inclusive, `YYYY-MM-DD`).
    pub fn get_daily_summaries(
        &self,
        user_id: &str,
        start: &str,
        end: &str,
    ) -> Result<Vec<DailySummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT user_id, book_id, date, minutes, pages, last_percent
                 FROM analytics_daily
                 WHERE user_id = ?1 AND date BETWEEN ?2 AND ?3
                 ORDER BY date ASC, book_id ASC",
            )
            .map_err(|e| AppError::Database(format!("Failed to prepare query: {}", e)))?;

        let summaries = stmt
            .query_map(params![user_id, start, end], |row| {
                Ok(DailySummary {
                    user_id: row.get(0)?,
                    book_id: row.get(1)?,
                    date: row.get(2)?,
                    minutes: row.get(3)?,
                    pages: row.get(4)?,
                    last_percent: row.get(5)?,
                })
            })
            .map_err(|e| AppError::Database(format!("Failed to get daily summaries: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Database(format!("Failed to collect summaries: {}", e)))?;

        Ok(summaries)
    }
}
