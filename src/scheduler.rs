//! Periodic streak re-evaluation.
//!
//! Each tick queues one item per user with an active rule, then works the
//! due items one user at a time on a bounded thread pool. A failed item is
//! re-queued on its own with a delay; the others are unaffected. Delivery is
//! at-least-once, which is safe because an evaluation only overwrites the
//! user's cache entry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rayon::prelude::*;

use crate::analytics::Analytics;
use crate::config::SchedulerConfig;
use crate::db::{Database, QueueItem};
use crate::error::{AppError, Result};
use crate::streaks::{MetricsCache, RuleResolver, StreakService};

/// Outcome of working the queue once.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueReport {
    /// Items claimed.
    pub claimed: usize,
    /// Items evaluated and removed.
    pub completed: usize,
    /// Items put back for a later delivery.
    pub retried: usize,
    /// Items abandoned.
    pub dropped: usize,
}

/// Outcome of one scheduler tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Users newly queued.
    pub queued: usize,
    /// Queue processing results.
    pub queue: QueueReport,
    /// Days re-aggregated by analytics.
    pub aggregated_days: usize,
}

enum ItemOutcome {
    Completed,
    Retried,
    Dropped,
}

/// Streak scheduler.
pub struct Scheduler<R, C> {
    db: Database,
    streaks: StreakService<R, C>,
    analytics: Analytics,
    config: SchedulerConfig,
    pool: rayon::ThreadPool,
}

impl<R: RuleResolver, C: MetricsCache> Scheduler<R, C> {
    /// Create a scheduler with a pool of `config.workers` threads.
    pub fn new(
        db: Database,
        streaks: StreakService<R, C>,
        analytics: Analytics,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("readstreak-worker-{}", i))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build worker pool: {}", e)))?;

        Ok(Self {
            db,
            streaks,
            analytics,
            config,
            pool,
        })
    }

    /// Queue every user with an active rule. Returns how many were added.
    pub fn enqueue_active(&self, now: DateTime<Utc>) -> Result<usize> {
        let users = self.db.list_active_rule_users()?;
        let mut queued = 0;

        for user_id in &users {
            if self.db.enqueue_streak_eval(user_id, now.timestamp())? {
                queued += 1;
            }
        }

        if queued > 0 {
            tracing::info!(count = queued, "Queued streak recalculation");
        }
        Ok(queued)
    }

    /// Work the items that are due at `now`.
    pub fn process_due(&self, now: DateTime<Utc>) -> Result<QueueReport> {
        let now_ts = now.timestamp();
        let lease_until = now_ts + self.config.retry_delay_seconds.max(1);
        let items = self
            .db
            .claim_due_items(now_ts, self.config.batch_size.max(1), lease_until)?;

        let mut report = QueueReport {
            claimed: items.len(),
            ..QueueReport::default()
        };
        if items.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<ItemOutcome> = self.pool.install(|| {
            items
                .par_iter()
                .map(|item| self.process_item(item, now))
                .collect()
        });

        for outcome in outcomes {
            match outcome {
                ItemOutcome::Completed => report.completed += 1,
                ItemOutcome::Retried => report.retried += 1,
                ItemOutcome::Dropped => report.dropped += 1,
            }
        }

        tracing::info!(
            claimed = report.claimed,
            completed = report.completed,
            retried = report.retried,
            dropped = report.dropped,
            "Processed streak queue"
        );
        Ok(report)
    }

    fn process_item(&self, item: &QueueItem, now: DateTime<Utc>) -> ItemOutcome {
        match self.streaks.refresh(&item.user_id, now) {
            Ok(_) => {
                // A failed delete leaves the item leased; it is redelivered later.
                if let Err(e) = self.db.delete_queue_item(item.id) {
                    tracing::warn!(user = %item.user_id, error = %e, "Failed to remove queue item");
                }
                ItemOutcome::Completed
            }
            Err(e) => {
                let attempts = item.attempts + 1;
                tracing::error!(
                    user = %item.user_id,
                    attempt = attempts,
                    error = %e,
                    "Failed to process streak queue item"
                );

                if e.is_retryable() && attempts < self.config.max_attempts {
                    let delay = self.config.retry_delay_seconds.max(1) * i64::from(attempts);
                    let released = self.db.release_queue_item(
                        item.id,
                        attempts,
                        now.timestamp() + delay,
                        &e.to_string(),
                    );
                    if let Err(release_err) = released {
                        tracing::warn!(user = %item.user_id, error = %release_err, "Failed to re-queue item");
                    }
                    ItemOutcome::Retried
                } else {
                    tracing::error!(user = %item.user_id, attempts, "Dropping streak queue item");
                    if let Err(delete_err) = self.db.delete_queue_item(item.id) {
                        tracing::warn!(user = %item.user_id, error = %delete_err, "Failed to remove queue item");
                    }
                    ItemOutcome::Dropped
                }
            }
        }
    }

    /// Queue, process and aggregate once.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let queued = self.enqueue_active(now)?;
        let queue = self.process_due(now)?;

        let aggregated_days = match self.analytics.aggregate_recent(now) {
            Ok(days) => days,
            Err(e) => {
                tracing::error!(error = %e, "Analytics aggregation failed");
                0
            }
        };

        Ok(TickReport {
            queued,
            queue,
            aggregated_days,
        })
    }
}

impl<R, C> Scheduler<R, C>
where
    R: RuleResolver + 'static,
    C: MetricsCache + 'static,
{
    /// Tick forever at `interval`, off the async runtime threads.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        tracing::info!(interval = ?interval, "Starting streak scheduler");
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            tracing::debug!("Running scheduled streak tick");

            let scheduler = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || scheduler.tick(Utc::now())).await {
                Ok(Ok(report)) => {
                    tracing::debug!(?report, "Scheduler tick finished");
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Scheduler tick failed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Scheduler tick aborted");
                }
            }
        }
    }
}
