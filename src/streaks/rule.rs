//! Per-user streak rules and the site-wide fallback.

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::{StreakDefaults, TargetType};
use crate::db::{Database, StoredRule, User};
use crate::streaks::day;

/// Resolved streak configuration for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreakRule {
    /// Owning user; `None` for the site-wide default.
    pub user_id: Option<String>,
    /// Metric compared against the target.
    pub target_type: TargetType,
    /// A day succeeds when its metric reaches this value.
    pub target_value: f64,
    /// Consecutive misses tolerated inside a streak.
    pub grace_days: u32,
    /// Zone used to bucket days.
    pub timezone: Tz,
    /// Days before this are never evaluated.
    pub start_date: Option<NaiveDate>,
    /// Inactive rules yield empty metrics.
    pub active: bool,
}

impl Default for StreakRule {
    fn default() -> Self {
        Self {
            user_id: None,
            target_type: TargetType::Pages,
            target_value: 0.0,
            grace_days: 0,
            timezone: Tz::UTC,
            start_date: None,
            active: true,
        }
    }
}

impl StreakRule {
    /// Build the site-wide default rule.
    pub fn from_defaults(defaults: &StreakDefaults) -> Self {
        Self {
            user_id: None,
            target_type: defaults.daily_target_type,
            target_value: defaults.daily_target_value.max(0.0),
            grace_days: defaults.grace_days,
            timezone: parse_timezone(&defaults.timezone).unwrap_or(Tz::UTC),
            start_date: defaults.start_date,
            active: true,
        }
    }
}

/// Storage key of a user's rule.
pub fn rule_key(user_id: &str) -> String {
    format!("user_{}", user_id)
}

/// Parse an IANA zone name; blank or unknown names yield `None`.
pub fn parse_timezone(name: &str) -> Option<Tz> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    match name.parse::<Tz>() {
        Ok(tz) => Some(tz),
        Err(_) => {
            tracing::warn!(timezone = %name, "Ignoring unknown timezone");
            None
        }
    }
}

/// Source of streak rules.
pub trait RuleResolver: Send + Sync {
    /// Rule governing `user_id`. Never fails; absent configuration
    /// resolves to defaults.
    fn resolve(&self, user_id: &str) -> StreakRule;
}

/// Rules stored in the database, falling back to configured defaults.
#[derive(Clone)]
pub struct RuleRepository {
    db: Database,
    defaults: StreakDefaults,
}

impl RuleRepository {
    /// Create a repository over `db`.
    pub fn new(db: Database, defaults: StreakDefaults) -> Self {
        Self { db, defaults }
    }

    /// Convert a stored rule, filling the timezone from the fallback chain.
    fn from_stored(&self, stored: StoredRule, user: Option<&User>) -> StreakRule {
        let timezone = stored
            .timezone
            .as_deref()
            .and_then(parse_timezone)
            .unwrap_or_else(|| self.user_or_site_timezone(user));

        let start_date = stored.start_date.as_deref().and_then(|raw| {
            let parsed = day::parse_log_date(raw);
            if parsed.is_none() {
                tracing::warn!(rule = %stored.id, start_date = %raw, "Ignoring unparseable start date");
            }
            parsed
        });

        StreakRule {
            user_id: Some(stored.user_id),
            target_type: TargetType::from_name(&stored.daily_target_type),
            target_value: stored.daily_target_value.max(0.0),
            grace_days: stored.grace_days,
            timezone,
            start_date,
            active: stored.active,
        }
    }

    fn user_or_site_timezone(&self, user: Option<&User>) -> Tz {
        user.and_then(|u| u.timezone.as_deref())
            .and_then(parse_timezone)
            .or_else(|| parse_timezone(&self.defaults.timezone))
            .unwrap_or(Tz::UTC)
    }
}

impl RuleResolver for RuleRepository {
    fn resolve(&self, user_id: &str) -> StreakRule {
        let user = self.db.get_user_by_id(user_id).unwrap_or_else(|e| {
            tracing::warn!(user = %user_id, error = %e, "Failed to load user for rule resolution");
            None
        });

        match self.db.get_rule(&rule_key(user_id)) {
            Ok(Some(stored)) => self.from_stored(stored, user.as_ref()),
            Ok(None) => StreakRule {
                timezone: self.user_or_site_timezone(user.as_ref()),
                ..StreakRule::from_defaults(&self.defaults)
            },
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "Failed to load streak rule, using defaults");
                StreakRule {
                    timezone: self.user_or_site_timezone(user.as_ref()),
                    ..StreakRule::from_defaults(&self.defaults)
                }
            }
        }
    }
}
