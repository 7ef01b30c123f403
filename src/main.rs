//! readstreak entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use readstreak::{
    analytics::{Analytics, NewReadingEvent},
    config::{
        AnalyticsCommand, Cli, Command, Config, LogCommand, RuleCommand, StreakCommand,
        UserCommand,
    },
    db::{self, Database, StoredRule, User},
    scheduler::Scheduler,
    streaks::{NewLog, RuleResolver, StreakMetrics, StreakService, rule},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "readstreak=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };

    // Handle command
    match cli.command {
        Some(Command::Init { force }) => cmd_init(force),
        Some(Command::User { action }) => cmd_user(action, &config),
        Some(Command::Rule { action }) => cmd_rule(action, &config),
        Some(Command::Log { action }) => cmd_log(action, &config),
        Some(Command::Streak { action }) => cmd_streak(action, &config),
        Some(Command::Analytics { action }) => cmd_analytics(action, &config),
        Some(Command::Run { once }) => cmd_run(config, once).await,
        None => cmd_run(config, false).await,
    }
}

/// Initialize config and database.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    // Write default config
    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    // Initialize database
    let config = Config::default();
    let _db = Database::open(&config.database.path)?;
    println!("Initialized database: {}", config.database.path.display());

    println!("\nEdit config.toml to set the default streak rule.");
    println!("Then run: readstreak user add <id> --timezone Europe/Paris");
    println!("And: readstreak rule set <id> --target-type pages --target-value 10 --grace-days 1");

    Ok(())
}

/// User management commands.
fn cmd_user(action: UserCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;

    match action {
        UserCommand::Add {
            id,
            name,
            timezone,
            opt_in,
        } => {
            if let Some(ref tz) = timezone
                && rule::parse_timezone(tz).is_none()
            {
                anyhow::bail!("Unknown timezone: {}", tz);
            }

            let user = User {
                id: id.clone(),
                name,
                timezone,
                analytics_opt_in: opt_in,
                created_at: db::now_timestamp(),
            };
            db.create_user(&user)?;
            println!("Created user: {}", id);
        }

        UserCommand::OptIn { id, choice } => {
            if db.set_user_opt_in(&id, choice.as_flag())? {
                println!("Updated telemetry consent of {}: {:?}", id, choice);
            } else {
                println!("User not found: {}", id);
            }
        }

        UserCommand::Del { id } => {
            if db.delete_user(&id)? {
                db.delete_streak_cache(&id)?;
                println!("Deleted user: {}", id);
            } else {
                println!("User not found: {}", id);
            }
        }

        UserCommand::List => {
            let users = db.list_users()?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<36} {:<24} {:<20} OPT-IN", "ID", "NAME", "TIMEZONE");
                println!("{}", "-".repeat(90));
                for user in users {
                    println!(
                        "{:<36} {:<24} {:<20} {}",
                        user.id,
                        user.name.as_deref().unwrap_or("-"),
                        user.timezone.as_deref().unwrap_or("-"),
                        match user.analytics_opt_in {
                            Some(true) => "yes",
                            Some(false) => "no",
                            None => "default",
                        }
                    );
                }
            }
        }
    }

    Ok(())
}

/// Streak rule commands.
fn cmd_rule(action: RuleCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;

    match action {
        RuleCommand::Set {
            user,
            target_type,
            target_value,
            grace_days,
            timezone,
            start_date,
            inactive,
        } => {
            if target_value < 0.0 {
                anyhow::bail!("Target value must not be negative");
            }
            if let Some(ref tz) = timezone
                && rule::parse_timezone(tz).is_none()
            {
                anyhow::bail!("Unknown timezone: {}", tz);
            }

            let stored = StoredRule {
                id: rule::rule_key(&user),
                user_id: user.clone(),
                daily_target_type: target_type.as_str().to_string(),
                daily_target_value: target_value,
                grace_days,
                timezone,
                start_date: start_date.map(readstreak::streaks::day::format_day),
                active: !inactive,
                updated_at: db::now_timestamp(),
            };
            db.save_rule(&stored)?;
            println!("Saved rule {} (active: {})", stored.id, stored.active);
        }

        RuleCommand::Show { user } => {
            let service = StreakService::with_database(db, config.streaks.clone());
            let resolved = service.rules().resolve(&user);
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }

        RuleCommand::Del { user } => {
            let key = rule::rule_key(&user);
            if db.delete_rule(&key)? {
                println!("Deleted rule: {}", key);
            } else {
                println!("Rule not found: {}", key);
            }
        }

        RuleCommand::List => {
            let rules = db.list_rules()?;
            if rules.is_empty() {
                println!("No rules found.");
            } else {
                println!(
                    "{:<24} {:<8} {:>8} {:>6} {:<20} ACTIVE",
                    "USER", "TARGET", "VALUE", "GRACE", "TIMEZONE"
                );
                println!("{}", "-".repeat(80));
                for r in rules {
                    println!(
                        "{:<24} {:<8} {:>8} {:>6} {:<20} {}",
                        r.user_id,
                        r.daily_target_type,
                        r.daily_target_value,
                        r.grace_days,
                        r.timezone.as_deref().unwrap_or("-"),
                        if r.active { "yes" } else { "no" }
                    );
                }
            }
        }
    }

    Ok(())
}

/// Reading log commands.
fn cmd_log(action: LogCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;

    match action {
        LogCommand::Add {
            user,
            book,
            pages,
            minutes,
            percent,
            source,
        } => {
            let service = StreakService::with_database(db, config.streaks.clone());
            let log = NewLog {
                user_id: user,
                book_id: book,
                pages_read: pages,
                minutes_read: minutes,
                percent_complete: percent,
                source,
            };
            let metrics = service.log_progress(&log, Utc::now())?;
            print_metrics(&metrics);
        }

        LogCommand::List { user } => {
            let logs = db.get_logs_for_user(&user)?;
            if logs.is_empty() {
                println!("No logs found.");
            } else {
                println!(
                    "{:<12} {:<36} {:>6} {:>8} {:>8} SOURCE",
                    "DATE", "BOOK", "PAGES", "MINUTES", "PERCENT"
                );
                println!("{}", "-".repeat(80));
                for log in logs {
                    println!(
                        "{:<12} {:<36} {:>6} {:>8} {:>8.1} {}",
                        log.log_date,
                        log.book_id,
                        log.pages_read,
                        log.minutes_read,
                        log.percent_complete,
                        log.source.as_str()
                    );
                }
            }
        }
    }

    Ok(())
}

/// Streak metrics commands.
fn cmd_streak(action: StreakCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;
    let service = StreakService::with_database(db.clone(), config.streaks.clone());

    match action {
        StreakCommand::Show { user, json } => {
            let metrics = service.metrics_for_display(&user, Utc::now())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                print_metrics(&metrics);
            }
        }

        StreakCommand::Refresh { user } => {
            let metrics = service.refresh(&user, Utc::now())?;
            print_metrics(&metrics);
        }

        StreakCommand::Enqueue => {
            let analytics = Analytics::new(db.clone(), config.analytics.clone());
            let scheduler = Scheduler::new(db, service, analytics, config.scheduler.clone())?;
            let queued = scheduler.enqueue_active(Utc::now())?;
            println!("Queued {} user(s) for re-evaluation.", queued);
        }

        StreakCommand::Queue => {
            let items = db.list_queue()?;
            if items.is_empty() {
                println!("Queue is empty.");
            } else {
                let now = Utc::now().timestamp();
                println!("{:<36} {:>8} {:>10} LAST ERROR", "USER", "ATTEMPTS", "DUE IN");
                println!("{}", "-".repeat(80));
                for item in items {
                    println!(
                        "{:<36} {:>8} {:>9}s {}",
                        item.user_id,
                        item.attempts,
                        (item.available_at - now).max(0),
                        item.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }

    Ok(())
}

/// Analytics commands.
fn cmd_analytics(action: AnalyticsCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;
    let analytics = Analytics::new(db.clone(), config.analytics.clone());

    match action {
        AnalyticsCommand::Ingest {
            user,
            book,
            started_at,
            ended_at,
            pages_delta,
            current_page,
            percent,
            source,
        } => {
            let event = analytics.ingest(&NewReadingEvent {
                user_id: user,
                book_id: book,
                started_at,
                ended_at,
                pages_delta,
                current_page,
                percent_complete: percent,
                source,
            })?;
            println!("Stored event: {} ({}s)", event.id, event.duration);
        }

        AnalyticsCommand::Aggregate { date } => {
            let now = Utc::now();
            match date {
                Some(date) => {
                    let summaries = analytics.aggregate_date(date, now)?;
                    println!("Aggregated {} summaries for {}", summaries.len(), date);
                }
                None => {
                    let days = analytics.aggregate_recent(now)?;
                    println!("Aggregated {} day(s)", days);
                }
            }
        }

        AnalyticsCommand::Summary { user, days } => {
            let summary = analytics.summary(&user, days, &db, Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

/// Run the scheduler.
async fn cmd_run(config: Config, once: bool) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;
    let service = StreakService::with_database(db.clone(), config.streaks.clone());
    let analytics = Analytics::new(db.clone(), config.analytics.clone());

    tracing::info!(
        database = %config.database.path.display(),
        interval = config.scheduler.interval_seconds,
        workers = config.scheduler.workers,
        "Starting readstreak"
    );

    let scheduler = Arc::new(Scheduler::new(
        db,
        service,
        analytics,
        config.scheduler.clone(),
    )?);

    if once || config.scheduler.interval_seconds == 0 {
        if !once {
            tracing::warn!("Scheduler interval is 0, running a single tick");
        }
        let runner = Arc::clone(&scheduler);
        let report = tokio::task::spawn_blocking(move || runner.tick(Utc::now())).await??;
        println!(
            "Queued {}, completed {}, retried {}, dropped {}, aggregated {} day(s)",
            report.queued,
            report.queue.completed,
            report.queue.retried,
            report.queue.dropped,
            report.aggregated_days
        );
        return Ok(());
    }

    let interval = Duration::from_secs(config.scheduler.interval_seconds);
    tokio::select! {
        _ = scheduler.run(interval) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}

/// Print metrics as summary cards and a heatmap row.
fn print_metrics(metrics: &StreakMetrics) {
    println!("Current streak:  {} day(s)", metrics.current_streak);
    println!("Longest streak:  {} day(s)", metrics.longest_streak);
    println!(
        "Last activity:   {}",
        metrics
            .last_active_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "No logs yet".to_string())
    );
    println!(
        "Last 30 days:    {} active, {} missed",
        metrics.active_days_in_window(),
        metrics.missed_days_in_window
    );

    let cells: String = metrics
        .heatmap
        .iter()
        .map(|cell| if cell.success { '#' } else { '.' })
        .collect();
    println!("                 {}", cells);
}
