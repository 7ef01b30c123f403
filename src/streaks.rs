//! Reading streak evaluation.
//!
//! Rules are resolved per user, logs are bucketed into calendar days of the
//! rule's timezone and walked by the [`engine`]; the result is kept in the
//! metrics cache until the next evaluation.

pub mod cache;
pub mod day;
pub mod engine;
pub mod rule;
mod service;

pub use cache::MetricsCache;
pub use engine::{HeatmapDay, StreakMetrics, evaluate};
pub use rule::{RuleRepository, RuleResolver, StreakRule};
pub use service::{NewLog, StreakService};
