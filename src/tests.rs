use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::analytics::{Analytics, NewReadingEvent};
use crate::config::{
    AnalyticsConfig, Config, LogSource, SchedulerConfig, StreakDefaults, TargetType,
};
use crate::db::{Database, ReadingLogEntry, StoredRule, User, now_timestamp};
use crate::error::{AppError, Result};
use crate::scheduler::Scheduler;
use crate::streaks::engine::{HEATMAP_DAYS, empty_metrics};
use crate::streaks::rule::rule_key;
use crate::streaks::{
    MetricsCache, NewLog, RuleRepository, RuleResolver, StreakMetrics, StreakRule, StreakService,
    day, evaluate,
};

fn test_db() -> Database {
    Database::open_memory().unwrap()
}

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn today() -> NaiveDate {
    fixed_now().date_naive()
}

fn days_ago(n: i64) -> NaiveDate {
    today() - Duration::days(n)
}

fn log_on(day: NaiveDate, pages: u32, minutes: u32, percent: f64) -> ReadingLogEntry {
    ReadingLogEntry {
        user_id: "user-1".to_string(),
        book_id: "book-1".to_string(),
        log_date: day.format("%Y-%m-%d").to_string(),
        pages_read: pages,
        minutes_read: minutes,
        percent_complete: percent,
        source: LogSource::Manual,
        updated_at: now_timestamp(),
    }
}

fn pages_rule(target: f64, grace: u32, start: Option<NaiveDate>) -> StreakRule {
    StreakRule {
        user_id: Some("user-1".to_string()),
        target_type: TargetType::Pages,
        target_value: target,
        grace_days: grace,
        timezone: Tz::UTC,
        start_date: start,
        active: true,
    }
}

fn create_user(db: &Database, id: &str, timezone: Option<&str>) {
    let user = User {
        id: id.to_string(),
        name: None,
        timezone: timezone.map(str::to_string),
        analytics_opt_in: None,
        created_at: now_timestamp(),
    };
    db.create_user(&user).unwrap();
}

fn save_rule(db: &Database, user: &str, target: f64, grace: u32, active: bool) {
    let rule = StoredRule {
        id: rule_key(user),
        user_id: user.to_string(),
        daily_target_type: "pages".to_string(),
        daily_target_value: target,
        grace_days: grace,
        timezone: None,
        start_date: None,
        active,
        updated_at: now_timestamp(),
    };
    db.save_rule(&rule).unwrap();
}

fn save_log(db: &Database, user: &str, day: NaiveDate, pages: u32) {
    let mut log = log_on(day, pages, 0, 0.0);
    log.user_id = user.to_string();
    db.save_log(&log).unwrap();
}

/// Cache that refuses writes for one user and stores the rest.
struct FlakyCache {
    db: Database,
    fail_for: String,
}

impl MetricsCache for FlakyCache {
    fn read(&self, user_id: &str) -> Result<Option<StreakMetrics>> {
        self.db.read(user_id)
    }

    fn write(&self, user_id: &str, metrics: &StreakMetrics) -> Result<()> {
        if user_id == self.fail_for {
            return Err(AppError::Database("cache unavailable".to_string()));
        }
        self.db.write(user_id, metrics)
    }
}

fn flaky_service(db: &Database, fail_for: &str) -> StreakService<RuleRepository, FlakyCache> {
    let rules = RuleRepository::new(db.clone(), StreakDefaults::default());
    let cache = FlakyCache {
        db: db.clone(),
        fail_for: fail_for.to_string(),
    };
    StreakService::new(db.clone(), rules, cache)
}

// ========== ENGINE ==========

#[test]
fn streak_empty_logs_yield_empty_metrics() {
    let metrics = evaluate(&[], &pages_rule(1.0, 1, None), fixed_now());

    assert_eq!(metrics.current_streak, 0);
    assert_eq!(metrics.longest_streak, 0);
    assert_eq!(metrics.last_active_date, None);
    assert_eq!(metrics.missed_days_in_window, 30);
    assert_eq!(metrics.heatmap.len(), 30);
    assert!(metrics.heatmap.iter().all(|cell| !cell.success));
    assert_eq!(metrics.heatmap.last().unwrap().date, today());
}

#[test]
fn streak_inactive_rule_ignores_logs() {
    let logs: Vec<_> = (0..10).map(|n| log_on(days_ago(n), 50, 50, 50.0)).collect();
    let mut rule = pages_rule(1.0, 0, None);
    rule.active = false;

    let metrics = evaluate(&logs, &rule, fixed_now());
    assert_eq!(metrics, empty_metrics(Tz::UTC, fixed_now()));
}

#[test]
fn streak_grace_covers_single_miss() {
    // Five-day window, day 3 missing.
    let start = days_ago(4);
    let logs = vec![
        log_on(days_ago(4), 1, 0, 0.0),
        log_on(days_ago(3), 1, 0, 0.0),
        log_on(days_ago(1), 1, 0, 0.0),
        log_on(days_ago(0), 1, 0, 0.0),
    ];

    let metrics = evaluate(&logs, &pages_rule(1.0, 1, Some(start)), fixed_now());
    assert_eq!(metrics.current_streak, 5);
    assert_eq!(metrics.longest_streak, 5);
    assert_eq!(metrics.last_active_date, Some(today()));
}

#[test]
fn streak_grace_exhaustion_breaks_run() {
    // Days 3 and 4 missing with one grace day.
    let start = days_ago(4);
    let logs = vec![
        log_on(days_ago(4), 1, 0, 0.0),
        log_on(days_ago(3), 1, 0, 0.0),
        log_on(days_ago(0), 1, 0, 0.0),
    ];

    let metrics = evaluate(&logs, &pages_rule(1.0, 1, Some(start)), fixed_now());
    assert_eq!(metrics.current_streak, 1);
    assert_eq!(metrics.longest_streak, 2);
}

#[test]
fn streak_grace_replenishes_after_success() {
    // S M S M S with one grace day: every miss is covered.
    let start = days_ago(4);
    let logs = vec![
        log_on(days_ago(4), 1, 0, 0.0),
        log_on(days_ago(2), 1, 0, 0.0),
        log_on(days_ago(0), 1, 0, 0.0),
    ];

    let metrics = evaluate(&logs, &pages_rule(1.0, 1, Some(start)), fixed_now());
    assert_eq!(metrics.current_streak, 5);
    assert_eq!(metrics.longest_streak, 5);
}

#[test]
fn streak_open_run_keeps_grace_covered_today() {
    let start = days_ago(4);
    let logs: Vec<_> = (1..=4).map(|n| log_on(days_ago(n), 3, 0, 0.0)).collect();

    let metrics = evaluate(&logs, &pages_rule(1.0, 1, Some(start)), fixed_now());
    assert_eq!(metrics.current_streak, 5);
    assert_eq!(metrics.longest_streak, 5);
    assert_eq!(metrics.last_active_date, Some(days_ago(1)));
    assert!(!metrics.heatmap.last().unwrap().success);
}

#[test]
fn streak_target_type_selects_metric() {
    let logs = vec![log_on(today(), 5, 0, 0.0)];

    let pages = pages_rule(5.0, 0, None);
    let metrics = evaluate(&logs, &pages, fixed_now());
    assert_eq!(metrics.current_streak, 1);
    assert_eq!(metrics.last_active_date, Some(today()));

    let minutes = StreakRule {
        target_type: TargetType::Minutes,
        target_value: 1.0,
        ..pages
    };
    let metrics = evaluate(&logs, &minutes, fixed_now());
    assert_eq!(metrics.current_streak, 0);
    assert_eq!(metrics.longest_streak, 0);
    assert_eq!(metrics.last_active_date, None);
    assert_eq!(metrics.missed_days_in_window, 30);
}

#[test]
fn streak_failed_log_counts_as_miss() {
    let logs = vec![log_on(today(), 2, 0, 0.0), log_on(days_ago(1), 10, 0, 0.0)];

    let metrics = evaluate(&logs, &pages_rule(5.0, 0, None), fixed_now());
    assert_eq!(metrics.current_streak, 0);
    assert_eq!(metrics.longest_streak, 1);
    assert_eq!(metrics.missed_days_in_window, 29);
}

#[test]
fn streak_start_date_floors_window() {
    let logs: Vec<_> = (0..=60).map(|n| log_on(days_ago(n), 10, 0, 0.0)).collect();

    let metrics = evaluate(&logs, &pages_rule(1.0, 0, Some(days_ago(10))), fixed_now());
    assert_eq!(metrics.current_streak, 11);
    assert_eq!(metrics.longest_streak, 11);
    assert_eq!(metrics.heatmap.len(), 30);
    assert_eq!(metrics.missed_days_in_window, 19);

    // A floor older than the heatmap leaves it untouched.
    let metrics = evaluate(&logs, &pages_rule(1.0, 0, Some(days_ago(45))), fixed_now());
    assert_eq!(metrics.longest_streak, 46);
    assert_eq!(metrics.missed_days_in_window, 0);
    assert!(metrics.heatmap.iter().all(|cell| cell.success));
}

#[test]
fn streak_future_start_date_evaluates_nothing() {
    let logs = vec![log_on(today(), 10, 0, 0.0)];

    let metrics = evaluate(&logs, &pages_rule(1.0, 0, Some(days_ago(-3))), fixed_now());
    assert_eq!(metrics.current_streak, 0);
    assert_eq!(metrics.longest_streak, 0);
    assert_eq!(metrics.last_active_date, None);
    assert_eq!(metrics.heatmap.len(), 30);
}

#[test]
fn streak_lookback_is_limited_to_a_year() {
    let logs: Vec<_> = (0..400).map(|n| log_on(days_ago(n), 1, 0, 0.0)).collect();

    let metrics = evaluate(&logs, &pages_rule(1.0, 0, None), fixed_now());
    assert_eq!(metrics.current_streak, 365);
    assert_eq!(metrics.longest_streak, 365);
}

#[test]
fn streak_old_logs_only() {
    let logs: Vec<_> = (90..100).map(|n| log_on(days_ago(n), 10, 0, 0.0)).collect();

    let metrics = evaluate(&logs, &pages_rule(1.0, 2, None), fixed_now());
    assert_eq!(metrics.current_streak, 0);
    assert_eq!(metrics.longest_streak, 10);
    assert_eq!(metrics.last_active_date, Some(days_ago(90)));
    assert_eq!(metrics.missed_days_in_window, 30);
    assert_eq!(metrics.heatmap.len(), 30);
}

#[test]
fn streak_same_day_entries_use_best_value() {
    let mut first = log_on(today(), 0, 0, 40.0);
    first.book_id = "book-1".to_string();
    let mut second = log_on(today(), 0, 0, 85.0);
    second.book_id = "book-2".to_string();
    let rule = StreakRule {
        target_type: TargetType::Percent,
        target_value: 80.0,
        ..pages_rule(0.0, 0, None)
    };

    let metrics = evaluate(&[first.clone(), second.clone()], &rule, fixed_now());
    assert_eq!(metrics.current_streak, 1);

    let metrics = evaluate(&[second, first], &rule, fixed_now());
    assert_eq!(metrics.current_streak, 1);
}

#[test]
fn streak_logs_in_any_order() {
    let mut logs: Vec<_> = (0..7).map(|n| log_on(days_ago(n), 3, 0, 0.0)).collect();
    let sorted = evaluate(&logs, &pages_rule(1.0, 0, None), fixed_now());
    logs.reverse();
    logs.swap(1, 4);
    let shuffled = evaluate(&logs, &pages_rule(1.0, 0, None), fixed_now());

    assert_eq!(sorted, shuffled);
    assert_eq!(sorted.current_streak, 7);
}

#[test]
fn streak_malformed_date_is_skipped() {
    let mut bad = log_on(today(), 10, 0, 0.0);
    bad.log_date = "yesterday-ish".to_string();
    let logs = vec![log_on(days_ago(1), 10, 0, 0.0), bad];

    let metrics = evaluate(&logs, &pages_rule(1.0, 0, None), fixed_now());
    assert_eq!(metrics.current_streak, 0);
    assert_eq!(metrics.longest_streak, 1);
    assert_eq!(metrics.last_active_date, Some(days_ago(1)));
}

#[test]
fn streak_future_logs_are_ignored() {
    let logs = vec![log_on(today(), 2, 0, 0.0), log_on(days_ago(-2), 2, 0, 0.0)];

    let metrics = evaluate(&logs, &pages_rule(1.0, 0, None), fixed_now());
    assert_eq!(metrics.current_streak, 1);
    assert_eq!(metrics.last_active_date, Some(today()));
}

#[test]
fn streak_evaluation_is_deterministic() {
    let logs: Vec<_> = [0, 1, 2, 5, 6, 9, 20]
        .iter()
        .map(|n| log_on(days_ago(*n), 4, 0, 0.0))
        .collect();
    let rule = pages_rule(2.0, 1, None);

    let first = evaluate(&logs, &rule, fixed_now());
    let second = evaluate(&logs, &rule, fixed_now());
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn streak_longest_never_below_current() {
    let mut seed: u64 = 0x2545_f491;
    for grace in 0..=3 {
        for _ in 0..20 {
            let mut logs = Vec::new();
            for n in 0..120 {
                seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                if (seed >> 33) % 3 != 0 {
                    logs.push(log_on(days_ago(n), ((seed >> 40) % 4) as u32, 0, 0.0));
                }
            }

            let metrics = evaluate(&logs, &pages_rule(1.0, grace, None), fixed_now());
            assert!(metrics.longest_streak >= metrics.current_streak);
            assert_eq!(metrics.heatmap.len() as u64, HEATMAP_DAYS);
        }
    }
}

#[test]
fn streak_heatmap_follows_rule_timezone() {
    // 23:30 UTC is already the next morning in Tokyo.
    let now = Utc.with_ymd_and_hms(2024, 3, 15, 23, 30, 0).unwrap();
    let rule = StreakRule {
        timezone: chrono_tz::Asia::Tokyo,
        ..pages_rule(1.0, 0, None)
    };
    let logs = vec![log_on(date(2024, 3, 16), 5, 0, 0.0)];

    let metrics = evaluate(&logs, &rule, now);
    assert_eq!(metrics.heatmap.first().unwrap().date, date(2024, 2, 16));
    assert_eq!(metrics.heatmap.last().unwrap().date, date(2024, 3, 16));
    assert!(metrics.heatmap.last().unwrap().success);
    assert_eq!(metrics.current_streak, 1);

    let utc = evaluate(&logs, &pages_rule(1.0, 0, None), now);
    assert_eq!(utc.heatmap.last().unwrap().date, date(2024, 3, 15));
    assert_eq!(utc.current_streak, 0);
}

#[test]
fn streak_heatmap_days_are_consecutive_across_dst() {
    // DST starts in New York on 2024-03-10.
    let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
    let metrics = empty_metrics(chrono_tz::America::New_York, now);

    assert_eq!(metrics.heatmap.len(), 30);
    assert_eq!(metrics.heatmap.last().unwrap().date, date(2024, 3, 10));
    for pair in metrics.heatmap.windows(2) {
        assert_eq!(pair[0].date.succ_opt(), Some(pair[1].date));
    }
}

#[test]
fn streak_grace_covers_consecutive_misses() {
    // S M M S S with two grace days.
    let start = days_ago(4);
    let logs = vec![
        log_on(days_ago(4), 1, 0, 0.0),
        log_on(days_ago(1), 1, 0, 0.0),
        log_on(days_ago(0), 1, 0, 0.0),
    ];

    let metrics = evaluate(&logs, &pages_rule(1.0, 2, Some(start)), fixed_now());
    assert_eq!(metrics.current_streak, 5);
    assert_eq!(metrics.longest_streak, 5);
}

#[test]
fn streak_grace_covers_miss_on_start_date() {
    let start = days_ago(4);
    let logs: Vec<_> = (0..=3).map(|n| log_on(days_ago(n), 2, 0, 0.0)).collect();

    let metrics = evaluate(&logs, &pages_rule(1.0, 1, Some(start)), fixed_now());
    assert_eq!(metrics.current_streak, 5);
    assert_eq!(metrics.longest_streak, 5);

    let metrics = evaluate(&logs, &pages_rule(1.0, 0, Some(start)), fixed_now());
    assert_eq!(metrics.current_streak, 4);
}

#[test]
fn streak_grace_covers_failed_first_log() {
    let logs = vec![
        log_on(days_ago(2), 0, 0, 0.0),
        log_on(days_ago(1), 3, 0, 0.0),
        log_on(days_ago(0), 3, 0, 0.0),
    ];

    let metrics = evaluate(&logs, &pages_rule(1.0, 1, None), fixed_now());
    assert_eq!(metrics.current_streak, 3);
    assert_eq!(metrics.longest_streak, 3);
}

#[test]
fn streak_grace_alone_does_not_start_a_streak() {
    // Only success is before the start date; today is covered by grace.
    let logs = vec![log_on(days_ago(1), 5, 0, 0.0)];

    let metrics = evaluate(&logs, &pages_rule(1.0, 1, Some(today())), fixed_now());
    assert_eq!(metrics.current_streak, 0);
    assert_eq!(metrics.longest_streak, 0);
    assert_eq!(metrics.last_active_date, None);
}

#[test]
fn streak_gap_after_break_stays_broken() {
    let logs = vec![log_on(days_ago(10), 5, 0, 0.0)];

    let metrics = evaluate(&logs, &pages_rule(1.0, 1, None), fixed_now());
    assert_eq!(metrics.current_streak, 0);
    assert_eq!(metrics.longest_streak, 1);
    assert_eq!(metrics.last_active_date, Some(days_ago(10)));
}

#[test]
fn streak_last_active_reaches_past_lookback() {
    let logs = vec![log_on(days_ago(400), 10, 0, 0.0)];

    let metrics = evaluate(&logs, &pages_rule(1.0, 0, None), fixed_now());
    assert_eq!(metrics.current_streak, 0);
    assert_eq!(metrics.longest_streak, 0);
    assert_eq!(metrics.last_active_date, Some(date(2023, 2, 9)));

    let floored = evaluate(&logs, &pages_rule(1.0, 0, Some(days_ago(399))), fixed_now());
    assert_eq!(floored.last_active_date, None);
}

// ========== DAYS ==========

#[test]
fn day_parse_log_date() {
    assert_eq!(day::parse_log_date("2024-03-15"), Some(date(2024, 3, 15)));
    assert_eq!(
        day::parse_log_date("2024-03-15T00:00:00"),
        Some(date(2024, 3, 15))
    );
    assert_eq!(day::parse_log_date("2024-02-30"), None);
    assert_eq!(day::parse_log_date("15/03/2024"), None);
    assert_eq!(day::parse_log_date(""), None);
}

#[test]
fn day_trailing_days_end_today() {
    let days: Vec<_> = day::trailing_days(date(2024, 3, 1), 3).collect();
    assert_eq!(days, vec![date(2024, 2, 28), date(2024, 2, 29), date(2024, 3, 1)]);
    assert_eq!(day::days_between(date(2024, 3, 2), date(2024, 3, 1)).count(), 0);
}

// ========== RULES ==========

#[test]
fn rule_defaults_when_absent() {
    let db = test_db();
    create_user(&db, "user-1", None);
    let defaults = StreakDefaults {
        daily_target_type: TargetType::Minutes,
        daily_target_value: 15.0,
        grace_days: 2,
        timezone: "Europe/Paris".to_string(),
        start_date: None,
    };

    let rule = RuleRepository::new(db, defaults).resolve("user-1");
    assert_eq!(rule.user_id, None);
    assert_eq!(rule.target_type, TargetType::Minutes);
    assert_eq!(rule.target_value, 15.0);
    assert_eq!(rule.grace_days, 2);
    assert_eq!(rule.timezone, chrono_tz::Europe::Paris);
    assert_eq!(rule.start_date, None);
    assert!(rule.active);
}

#[test]
fn rule_hard_defaults() {
    let db = test_db();
    let rule = RuleRepository::new(db, StreakDefaults::default()).resolve("nobody");
    assert_eq!(rule, StreakRule::default());
}

#[test]
fn rule_stored_rule_wins() {
    let db = test_db();
    create_user(&db, "user-1", Some("America/Chicago"));
    db.save_rule(&StoredRule {
        id: rule_key("user-1"),
        user_id: "user-1".to_string(),
        daily_target_type: "percent".to_string(),
        daily_target_value: 5.0,
        grace_days: 1,
        timezone: Some("Asia/Tokyo".to_string()),
        start_date: Some("2024-01-01".to_string()),
        active: false,
        updated_at: now_timestamp(),
    })
    .unwrap();

    let rule = RuleRepository::new(db, StreakDefaults::default()).resolve("user-1");
    assert_eq!(rule.user_id.as_deref(), Some("user-1"));
    assert_eq!(rule.target_type, TargetType::Percent);
    assert_eq!(rule.timezone, chrono_tz::Asia::Tokyo);
    assert_eq!(rule.start_date, Some(date(2024, 1, 1)));
    assert!(!rule.active);
}

#[test]
fn rule_timezone_falls_back_to_user_then_site() {
    let db = test_db();
    create_user(&db, "user-1", Some("America/Chicago"));
    create_user(&db, "user-2", Some("Not/AZone"));
    save_rule(&db, "user-1", 1.0, 0, true);
    save_rule(&db, "user-2", 1.0, 0, true);
    let defaults = StreakDefaults {
        timezone: "Europe/Berlin".to_string(),
        ..StreakDefaults::default()
    };

    let repo = RuleRepository::new(db, defaults);
    assert_eq!(repo.resolve("user-1").timezone, chrono_tz::America::Chicago);
    assert_eq!(repo.resolve("user-2").timezone, chrono_tz::Europe::Berlin);
}

#[test]
fn rule_unknown_target_type_is_pages() {
    assert_eq!(TargetType::from_name("chapters"), TargetType::Pages);
    assert_eq!(TargetType::from_name("Minutes"), TargetType::Minutes);
    assert_eq!(LogSource::sanitize("kindle"), LogSource::Manual);
    assert_eq!(LogSource::sanitize("epub-reader"), LogSource::EpubReader);
}

// ========== CACHE ==========

#[test]
fn cache_miss_returns_none() {
    let db = test_db();
    assert!(db.read("user-1").unwrap().is_none());
}

#[test]
fn cache_keeps_last_write() {
    let db = test_db();
    let mut metrics = evaluate(
        &[log_on(today(), 5, 0, 0.0)],
        &pages_rule(1.0, 0, None),
        fixed_now(),
    );
    db.write("user-1", &metrics).unwrap();
    assert_eq!(db.read("user-1").unwrap(), Some(metrics.clone()));

    metrics.current_streak = 0;
    metrics.last_active_date = None;
    db.write("user-1", &metrics).unwrap();
    assert_eq!(db.read("user-1").unwrap(), Some(metrics));
}

#[test]
fn cache_unreadable_entry_is_a_miss() {
    let db = test_db();
    db.save_streak_cache(&crate::db::StreakCacheRow {
        user_id: "user-1".to_string(),
        current_streak: 3,
        longest_streak: 3,
        last_active: None,
        missed_days_window: 0,
        heatmap_json: "{not json".to_string(),
        updated_at: now_timestamp(),
    })
    .unwrap();

    assert!(db.read("user-1").unwrap().is_none());
}

// ========== SERVICE ==========

#[test]
fn service_unknown_user_gets_empty_metrics() {
    let db = test_db();
    let service = StreakService::with_database(db, StreakDefaults::default());

    let metrics = service.evaluate("ghost", fixed_now()).unwrap();
    assert_eq!(metrics, empty_metrics(Tz::UTC, fixed_now()));
}

#[test]
fn service_refresh_is_idempotent() {
    let db = test_db();
    create_user(&db, "user-1", None);
    save_rule(&db, "user-1", 1.0, 0, true);
    for n in 0..3 {
        save_log(&db, "user-1", days_ago(n), 5);
    }
    let service = StreakService::with_database(db.clone(), StreakDefaults::default());

    let first = service.refresh("user-1", fixed_now()).unwrap();
    let second = service.refresh("user-1", fixed_now()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.current_streak, 3);
    assert_eq!(db.read("user-1").unwrap(), Some(second));
}

#[test]
fn service_display_prefers_cache() {
    let db = test_db();
    create_user(&db, "user-1", None);
    save_log(&db, "user-1", today(), 5);
    let service = StreakService::with_database(db.clone(), StreakDefaults::default());

    let mut stale = empty_metrics(Tz::UTC, fixed_now());
    stale.current_streak = 42;
    stale.longest_streak = 42;
    db.write("user-1", &stale).unwrap();

    let shown = service.metrics_for_display("user-1", fixed_now()).unwrap();
    assert_eq!(shown.current_streak, 42);
}

#[test]
fn service_display_evaluates_on_miss_and_stores() {
    let db = test_db();
    create_user(&db, "user-1", None);
    save_log(&db, "user-1", today(), 5);
    let service = StreakService::with_database(db.clone(), StreakDefaults::default());

    let shown = service.metrics_for_display("user-1", fixed_now()).unwrap();
    assert_eq!(shown.current_streak, 1);
    assert_eq!(db.read("user-1").unwrap(), Some(shown));
}

#[test]
fn service_display_survives_cache_failure() {
    let db = test_db();
    create_user(&db, "user-1", None);
    save_log(&db, "user-1", today(), 5);
    let service = flaky_service(&db, "user-1");

    let shown = service.metrics_for_display("user-1", fixed_now()).unwrap();
    assert_eq!(shown.current_streak, 1);
    assert!(db.read("user-1").unwrap().is_none());
}

#[test]
fn service_refresh_surfaces_cache_failure() {
    let db = test_db();
    create_user(&db, "user-1", None);
    let service = flaky_service(&db, "user-1");

    let err = service.refresh("user-1", fixed_now()).unwrap_err();
    assert!(err.is_retryable());
}

#[test]
fn service_log_progress_overwrites_the_day() {
    let db = test_db();
    create_user(&db, "user-1", None);
    save_rule(&db, "user-1", 10.0, 0, true);
    let service = StreakService::with_database(db.clone(), StreakDefaults::default());
    let mut log = NewLog {
        user_id: "user-1".to_string(),
        book_id: "book-1".to_string(),
        pages_read: 4,
        minutes_read: 10,
        percent_complete: 12.5,
        source: LogSource::PdfReader,
    };

    let metrics = service.log_progress(&log, fixed_now()).unwrap();
    assert_eq!(metrics.current_streak, 0);

    log.pages_read = 12;
    let metrics = service.log_progress(&log, fixed_now()).unwrap();
    assert_eq!(metrics.current_streak, 1);

    let logs = db.get_logs_for_user("user-1").unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].pages_read, 12);
    assert_eq!(logs[0].source, LogSource::PdfReader);
    assert_eq!(db.read("user-1").unwrap(), Some(metrics));
}

#[test]
fn service_log_progress_uses_user_day() {
    let db = test_db();
    create_user(&db, "user-1", Some("Asia/Tokyo"));
    let service = StreakService::with_database(db.clone(), StreakDefaults::default());
    let now = Utc.with_ymd_and_hms(2024, 3, 15, 23, 30, 0).unwrap();

    service
        .log_progress(
            &NewLog {
                user_id: "user-1".to_string(),
                book_id: "book-1".to_string(),
                pages_read: 1,
                minutes_read: 0,
                percent_complete: 0.0,
                source: LogSource::Manual,
            },
            now,
        )
        .unwrap();

    let logs = db.get_logs_for_user("user-1").unwrap();
    assert_eq!(logs[0].log_date, "2024-03-16");
}

#[test]
fn service_log_progress_rejects_bad_input() {
    let db = test_db();
    create_user(&db, "user-1", None);
    let service = StreakService::with_database(db, StreakDefaults::default());
    let mut log = NewLog {
        user_id: "user-1".to_string(),
        book_id: " ".to_string(),
        pages_read: 1,
        minutes_read: 0,
        percent_complete: 0.0,
        source: LogSource::Manual,
    };

    assert!(matches!(
        service.log_progress(&log, fixed_now()),
        Err(AppError::InvalidInput(_))
    ));

    log.book_id = "book-1".to_string();
    log.user_id = "ghost".to_string();
    assert!(matches!(
        service.log_progress(&log, fixed_now()),
        Err(AppError::NotFound(_))
    ));
}

// ========== SCHEDULER ==========

fn scheduler_config(max_attempts: u32) -> SchedulerConfig {
    SchedulerConfig {
        workers: 2,
        max_attempts,
        retry_delay_seconds: 60,
        ..SchedulerConfig::default()
    }
}

#[test]
fn scheduler_queues_active_rules_once() {
    let db = test_db();
    save_rule(&db, "user-1", 1.0, 0, true);
    save_rule(&db, "user-2", 1.0, 0, false);
    save_rule(&db, "user-3", 1.0, 0, true);
    let scheduler = Scheduler::new(
        db.clone(),
        StreakService::with_database(db.clone(), StreakDefaults::default()),
        Analytics::new(db.clone(), AnalyticsConfig::default()),
        scheduler_config(3),
    )
    .unwrap();

    assert_eq!(scheduler.enqueue_active(fixed_now()).unwrap(), 2);
    assert_eq!(scheduler.enqueue_active(fixed_now()).unwrap(), 0);

    let queued: Vec<_> = db.list_queue().unwrap().into_iter().map(|i| i.user_id).collect();
    assert_eq!(queued, vec!["user-1".to_string(), "user-3".to_string()]);
}

#[test]
fn scheduler_processes_and_caches() {
    let db = test_db();
    for user in ["user-1", "user-2"] {
        create_user(&db, user, None);
        save_rule(&db, user, 1.0, 0, true);
        save_log(&db, user, today(), 3);
    }
    let scheduler = Scheduler::new(
        db.clone(),
        StreakService::with_database(db.clone(), StreakDefaults::default()),
        Analytics::new(db.clone(), AnalyticsConfig::default()),
        scheduler_config(3),
    )
    .unwrap();

    let report = scheduler.tick(fixed_now()).unwrap();
    assert_eq!(report.queued, 2);
    assert_eq!(report.queue.completed, 2);
    assert!(db.list_queue().unwrap().is_empty());
    assert_eq!(db.read("user-1").unwrap().unwrap().current_streak, 1);
    assert_eq!(db.read("user-2").unwrap().unwrap().current_streak, 1);
}

#[test]
fn scheduler_failure_is_isolated_and_retried() {
    let db = test_db();
    for user in ["user-bad", "user-good"] {
        create_user(&db, user, None);
        save_rule(&db, user, 1.0, 0, true);
        save_log(&db, user, today(), 3);
    }
    let scheduler = Scheduler::new(
        db.clone(),
        flaky_service(&db, "user-bad"),
        Analytics::new(db.clone(), AnalyticsConfig::default()),
        scheduler_config(3),
    )
    .unwrap();

    scheduler.enqueue_active(fixed_now()).unwrap();
    let report = scheduler.process_due(fixed_now()).unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.retried, 1);
    assert!(db.read("user-good").unwrap().is_some());

    let pending = db.list_queue().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].user_id, "user-bad");
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.is_some());

    // Not redelivered before the retry delay.
    assert_eq!(scheduler.process_due(fixed_now()).unwrap().claimed, 0);

    let later = fixed_now() + Duration::seconds(61);
    let report = scheduler.process_due(later).unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(db.list_queue().unwrap()[0].attempts, 2);
}

#[test]
fn scheduler_drops_after_max_attempts() {
    let db = test_db();
    create_user(&db, "user-bad", None);
    save_rule(&db, "user-bad", 1.0, 0, true);
    let scheduler = Scheduler::new(
        db.clone(),
        flaky_service(&db, "user-bad"),
        Analytics::new(db.clone(), AnalyticsConfig::default()),
        scheduler_config(1),
    )
    .unwrap();

    scheduler.enqueue_active(fixed_now()).unwrap();
    let report = scheduler.process_due(fixed_now()).unwrap();
    assert_eq!(report.dropped, 1);
    assert!(db.list_queue().unwrap().is_empty());
}

#[tokio::test]
async fn scheduler_tick_runs_off_runtime() {
    let db = test_db();
    create_user(&db, "user-1", None);
    save_rule(&db, "user-1", 1.0, 0, true);
    let scheduler = std::sync::Arc::new(
        Scheduler::new(
            db.clone(),
            StreakService::with_database(db.clone(), StreakDefaults::default()),
            Analytics::new(db.clone(), AnalyticsConfig::default()),
            scheduler_config(3),
        )
        .unwrap(),
    );

    let runner = std::sync::Arc::clone(&scheduler);
    let report = tokio::task::spawn_blocking(move || runner.tick(fixed_now()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.queue.completed, 1);
    assert_eq!(report.aggregated_days, 30);
}

// ========== ANALYTICS ==========

fn event(start: DateTime<Utc>, minutes: i64, pages: i64, percent: f64) -> NewReadingEvent {
    NewReadingEvent {
        user_id: "user-1".to_string(),
        book_id: "book-1".to_string(),
        started_at: start,
        ended_at: start + Duration::minutes(minutes),
        pages_delta: pages,
        current_page: 0,
        percent_complete: percent,
        source: LogSource::EpubReader,
    }
}

#[test]
fn analytics_debounce_rejects_rapid_repeat() {
    let db = test_db();
    let analytics = Analytics::new(db, AnalyticsConfig::default());
    let start = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();

    analytics.ingest(&event(start, 30, 5, 10.0)).unwrap();

    let repeat = event(start + Duration::seconds(30 * 60 + 2), 1, 0, 10.0);
    assert!(matches!(
        analytics.ingest(&repeat),
        Err(AppError::Duplicate(_))
    ));

    let progressed = event(start + Duration::seconds(30 * 60 + 2), 10, 3, 12.0);
    assert!(analytics.ingest(&progressed).is_ok());
}

#[test]
fn analytics_ingest_normalizes_session() {
    let db = test_db();
    let analytics = Analytics::new(db, AnalyticsConfig::default());
    let start = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
    let mut backwards = event(start, 0, 1, 150.0);
    backwards.ended_at = start - Duration::minutes(5);

    let stored = analytics.ingest(&backwards).unwrap();
    assert_eq!(stored.ended_at, stored.started_at);
    assert_eq!(stored.duration, 0);
    assert_eq!(stored.percent_complete, 100.0);
}

#[test]
fn analytics_ingest_respects_switches() {
    let db = test_db();
    let analytics = Analytics::new(
        db,
        AnalyticsConfig {
            telemetry_enabled: false,
            ..AnalyticsConfig::default()
        },
    );

    let start = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
    assert!(matches!(
        analytics.ingest(&event(start, 5, 1, 0.0)),
        Err(AppError::Disabled(_))
    ));
}

#[test]
fn analytics_aggregate_date_sums_and_repeats() {
    let db = test_db();
    let analytics = Analytics::new(db.clone(), AnalyticsConfig::default());
    let start = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
    analytics.ingest(&event(start, 30, 5, 10.0)).unwrap();
    analytics
        .ingest(&event(start + Duration::minutes(45), 10, 3, 12.0))
        .unwrap();
    let mut other_book = event(start, 20, 7, 3.0);
    other_book.book_id = "book-2".to_string();
    analytics.ingest(&other_book).unwrap();

    let first = analytics.aggregate_date(date(2024, 3, 15), fixed_now()).unwrap();
    let second = analytics.aggregate_date(date(2024, 3, 15), fixed_now()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].book_id, "book-1");
    assert_eq!(first[0].minutes, 40);
    assert_eq!(first[0].pages, 8);
    assert_eq!(first[0].last_percent, 12.0);

    let stored = db
        .get_daily_summaries("user-1", "2024-03-15", "2024-03-15")
        .unwrap();
    assert_eq!(stored.len(), 2);

    assert!(analytics.aggregate_date(date(2024, 3, 14), fixed_now()).unwrap().is_empty());
}

#[test]
fn analytics_series_and_kpis() {
    let db = test_db();
    let analytics = Analytics::new(db.clone(), AnalyticsConfig::default());
    let start = Utc.with_ymd_and_hms(2024, 3, 14, 10, 0, 0).unwrap();
    analytics.ingest(&event(start, 30, 5, 10.0)).unwrap();
    analytics.aggregate_recent(fixed_now()).unwrap();

    let mut cached = empty_metrics(Tz::UTC, fixed_now());
    cached.current_streak = 3;
    cached.longest_streak = 3;
    db.write("user-1", &cached).unwrap();

    let series = analytics.recent_series("user-1", 14, fixed_now()).unwrap();
    assert_eq!(series.len(), 14);
    assert_eq!(series.last().unwrap().date, today());
    assert_eq!(series[12].minutes, 30);
    assert_eq!(series.iter().map(|p| p.pages).sum::<i64>(), 5);

    let kpis = analytics.weekly_kpis("user-1", &db, fixed_now()).unwrap();
    assert_eq!(kpis.total_minutes, 30);
    assert_eq!(kpis.total_pages, 5);
    assert_eq!(kpis.active_days, 1);
    assert_eq!(kpis.current_streak, 3);

    let sessions = analytics.recent_sessions("user-1", 10).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].minutes, 30);
    assert_eq!(sessions[0].source, LogSource::EpubReader);
}

#[test]
fn analytics_ingest_rejects_blank_book() {
    let db = test_db();
    let analytics = Analytics::new(db, AnalyticsConfig::default());
    let start = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
    let mut blank = event(start, 5, 1, 0.0);
    blank.book_id = "  ".to_string();

    assert!(matches!(
        analytics.ingest(&blank),
        Err(AppError::InvalidInput(_))
    ));
}

#[test]
fn analytics_ingest_follows_user_consent() {
    let db = test_db();
    create_user(&db, "user-unset", None);
    create_user(&db, "user-out", None);
    create_user(&db, "user-in", None);
    assert!(db.set_user_opt_in("user-out", Some(false)).unwrap());
    assert!(db.set_user_opt_in("user-in", Some(true)).unwrap());
    assert!(!db.set_user_opt_in("ghost", Some(true)).unwrap());
    assert_eq!(
        db.get_user_by_id("user-out").unwrap().unwrap().analytics_opt_in,
        Some(false)
    );

    let start = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
    let for_user = |user: &str| NewReadingEvent {
        user_id: user.to_string(),
        ..event(start, 5, 1, 0.0)
    };

    let default_in = Analytics::new(db.clone(), AnalyticsConfig::default());
    assert!(default_in.ingest(&for_user("user-unset")).is_ok());
    assert!(matches!(
        default_in.ingest(&for_user("user-out")),
        Err(AppError::Disabled(_))
    ));

    let default_out = Analytics::new(
        db,
        AnalyticsConfig {
            default_user_opt_in: false,
            ..AnalyticsConfig::default()
        },
    );
    assert!(matches!(
        default_out.ingest(&for_user("user-unset")),
        Err(AppError::Disabled(_))
    ));
    assert!(matches!(
        default_out.ingest(&for_user("user-out")),
        Err(AppError::Disabled(_))
    ));
    assert!(default_out.ingest(&for_user("user-in")).is_ok());
}

#[test]
fn analytics_summary_includes_unaggregated_today() {
    let db = test_db();
    let analytics = Analytics::new(db.clone(), AnalyticsConfig::default());
    let start = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
    analytics.ingest(&event(start, 20, 4, 8.0)).unwrap();

    let summary = analytics.summary("user-1", 7, &db, fixed_now()).unwrap();
    assert_eq!(summary.kpis.total_minutes, 20);
    assert_eq!(summary.kpis.total_pages, 4);
    assert_eq!(summary.series.len(), 7);
    assert_eq!(summary.series.last().unwrap().minutes, 20);
    assert_eq!(summary.sessions.len(), 1);
}

#[test]
fn analytics_lookback_is_bounded() {
    let db = test_db();
    let wide = Analytics::new(
        db.clone(),
        AnalyticsConfig {
            aggregation_lookback_days: 10_000,
            ..AnalyticsConfig::default()
        },
    );
    assert_eq!(wide.aggregate_recent(fixed_now()).unwrap(), 365);

    let none = Analytics::new(
        db,
        AnalyticsConfig {
            aggregation_lookback_days: 0,
            ..AnalyticsConfig::default()
        },
    );
    assert_eq!(none.aggregate_recent(fixed_now()).unwrap(), 1);
}

// ========== DATABASE ==========

#[test]
fn db_logs_upsert_and_order() {
    let db = test_db();
    save_log(&db, "user-1", days_ago(1), 5);
    save_log(&db, "user-1", days_ago(3), 5);
    save_log(&db, "user-1", days_ago(1), 9);
    save_log(&db, "user-2", days_ago(2), 1);

    let logs = db.get_logs_for_user("user-1").unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].log_date, days_ago(3).to_string());
    assert_eq!(logs[1].pages_read, 9);
}

#[test]
fn db_create_list_delete_user() {
    let db = test_db();
    create_user(&db, "user-1", Some("UTC"));
    assert!(db.create_user(&User {
        id: "user-1".to_string(),
        name: None,
        timezone: None,
        analytics_opt_in: None,
        created_at: now_timestamp(),
    })
    .is_err());

    assert_eq!(db.list_users().unwrap().len(), 1);
    assert!(db.delete_user("user-1").unwrap());
    assert!(db.get_user_by_id("user-1").unwrap().is_none());
}

#[test]
fn db_rules_roundtrip_and_delete() {
    let db = test_db();
    save_rule(&db, "user-1", 3.0, 1, true);
    save_rule(&db, "user-1", 4.0, 1, true);

    let rules = db.list_rules().unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].daily_target_value, 4.0);
    assert!(db.delete_rule(&rule_key("user-1")).unwrap());
    assert!(db.get_rule(&rule_key("user-1")).unwrap().is_none());
}

#[test]
fn db_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("streaks.db");

    {
        let db = Database::open(&path).unwrap();
        save_log(&db, "user-1", today(), 7);
    }

    let db = Database::open(&path).unwrap();
    let logs = db.get_logs_for_user("user-1").unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].pages_read, 7);
}

// ========== CONFIG ==========

#[test]
fn config_parse_toml() {
    let toml = r#"
[database]
path = "/tmp/test.db"

[streaks]
daily_target_type = "minutes"
daily_target_value = 20
grace_days = 2
timezone = "Europe/Paris"
start_date = "2024-01-01"

[scheduler]
interval_seconds = 600
workers = 4

[analytics]
telemetry_enabled = false
default_user_opt_in = false
debounce_seconds = 10
"#;
    let config: Config = toml::from_str(toml).unwrap();
    assert_eq!(config.database.path.to_str(), Some("/tmp/test.db"));
    assert_eq!(config.streaks.daily_target_type, TargetType::Minutes);
    assert_eq!(config.streaks.daily_target_value, 20.0);
    assert_eq!(config.streaks.grace_days, 2);
    assert_eq!(config.streaks.start_date, Some(date(2024, 1, 1)));
    assert_eq!(config.scheduler.interval_seconds, 600);
    assert_eq!(config.scheduler.workers, 4);
    assert_eq!(config.scheduler.max_attempts, 5);
    assert!(!config.analytics.telemetry_enabled);
    assert!(!config.analytics.default_user_opt_in);
    assert_eq!(config.analytics.debounce_seconds, 10);
    assert_eq!(config.analytics.aggregation_lookback_days, 30);
}

#[test]
fn config_default_values() {
    let config = Config::default();
    assert_eq!(config.streaks.daily_target_type, TargetType::Pages);
    assert_eq!(config.streaks.timezone, "UTC");
    assert_eq!(config.scheduler.workers, 1);
    assert!(config.analytics.telemetry_enabled);
    assert!(config.analytics.default_user_opt_in);
}

#[test]
fn config_generated_default_parses() {
    let config: Config = toml::from_str(&Config::generate_default()).unwrap();
    assert_eq!(config.streaks.daily_target_value, 10.0);
    assert_eq!(config.streaks.grace_days, 1);
}
