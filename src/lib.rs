//! readstreak: reading streaks and activity analytics for book-sharing sites.
//!
//! This crate turns per-day reading logs into streak metrics for each user
//! and keeps them in a cache refreshed by a scheduler.
//!
//! # Features
//!
//! - Per-user streak rules with site-wide defaults
//! - Daily targets in pages, minutes or percent complete
//! - Grace days that keep a streak alive across short gaps
//! - Timezone-aware day bucketing and a 30-day heatmap
//! - Metrics cache with read-through evaluation
//! - Queue-based re-evaluation with per-user retries
//! - Reading session ingest with debounce and daily aggregation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Reading session analytics.
pub mod analytics;
/// Configuration and CLI.
pub mod config;
/// Database operations.
pub mod db;
/// Error types.
pub mod error;
/// Scheduled re-evaluation.
pub mod scheduler;
/// Streak rules, evaluation and cache.
pub mod streaks;

#[cfg(test)]
mod tests;

pub use analytics::Analytics;
pub use config::{Cli, Command, Config};
pub use db::Database;
pub use error::{AppError, Result};
pub use scheduler::Scheduler;
pub use streaks::StreakService;
