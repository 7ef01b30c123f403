use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Reading streak evaluation and activity aggregation.
#[derive(Parser, Debug, Clone)]
#[command(name = "readstreak")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "READSTREAK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the scheduler (default if no command given).
    Run {
        /// Run a single scheduler tick and exit.
        #[arg(long)]
        once: bool,
    },

    /// User management commands.
    User {
        /// User subcommand action.
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Streak rule management commands.
    Rule {
        /// Rule subcommand action.
        #[command(subcommand)]
        action: RuleCommand,
    },

    /// Reading log commands.
    Log {
        /// Log subcommand action.
        #[command(subcommand)]
        action: LogCommand,
    },

    /// Streak metrics commands.
    Streak {
        /// Streak subcommand action.
        #[command(subcommand)]
        action: StreakCommand,
    },

    /// Reading analytics commands.
    Analytics {
        /// Analytics subcommand action.
        #[command(subcommand)]
        action: AnalyticsCommand,
    },

    /// Initialize database and create default config.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// User management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UserCommand {
    /// Add a new user.
    Add {
        /// User ID.
        id: String,
        /// Display name.
        #[arg(short, long)]
        name: Option<String>,
        /// IANA timezone of the user.
        #[arg(short, long)]
        timezone: Option<String>,
        /// Reading telemetry consent (site default when omitted).
        #[arg(long)]
        opt_in: Option<bool>,
    },

    /// Set a user's reading telemetry consent.
    OptIn {
        /// User ID.
        id: String,
        /// Consent to record.
        #[arg(value_enum)]
        choice: OptInChoice,
    },

    /// Delete a user.
    Del {
        /// User ID to delete.
        id: String,
    },

    /// List all users.
    List,
}

/// Telemetry consent choices.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptInChoice {
    /// Record reading sessions.
    In,
    /// Never record reading sessions.
    Out,
    /// Follow the site default.
    Default,
}

impl OptInChoice {
    /// Stored flag; `None` follows the site default.
    pub fn as_flag(self) -> Option<bool> {
        match self {
            OptInChoice::In => Some(true),
            OptInChoice::Out => Some(false),
            OptInChoice::Default => None,
        }
    }
}

/// Streak rule subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum RuleCommand {
    /// Create or replace the rule of a user.
    Set {
        /// User ID.
        user: String,
        /// Metric compared against the daily target.
        #[arg(long, default_value = "pages")]
        target_type: TargetType,
        /// Daily target value.
        #[arg(long, default_value = "0")]
        target_value: f64,
        /// Consecutive misses tolerated before a streak breaks.
        #[arg(long, default_value = "0")]
        grace_days: u32,
        /// IANA timezone used for day bucketing.
        #[arg(long)]
        timezone: Option<String>,
        /// First day considered by the evaluation (YYYY-MM-DD).
        #[arg(long)]
        start_date: Option<NaiveDate>,
        /// Store the rule as inactive.
        #[arg(long)]
        inactive: bool,
    },

    /// Show the resolved rule of a user.
    Show {
        /// User ID.
        user: String,
    },

    /// Delete the rule of a user (falls back to site defaults).
    Del {
        /// User ID.
        user: String,
    },

    /// List stored rules.
    List,
}

/// Reading log subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum LogCommand {
    /// Record today's progress on a book.
    Add {
        /// User ID.
        user: String,
        /// Book ID.
        book: String,
        /// Pages read today.
        #[arg(long, default_value = "0")]
        pages: u32,
        /// Minutes read today.
        #[arg(long, default_value = "0")]
        minutes: u32,
        /// Percent of the book completed.
        #[arg(long, default_value = "0")]
        percent: f64,
        /// Where the progress was recorded.
        #[arg(long, default_value = "manual")]
        source: LogSource,
    },

    /// List the logs of a user.
    List {
        /// User ID.
        user: String,
    },
}

/// Streak metrics subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum StreakCommand {
    /// Show metrics (cached, evaluated on a miss).
    Show {
        /// User ID.
        user: String,
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Re-evaluate and store metrics for a user.
    Refresh {
        /// User ID.
        user: String,
    },

    /// Queue re-evaluation for every user with an active rule.
    Enqueue,

    /// List pending re-evaluations.
    Queue,
}

/// Analytics subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum AnalyticsCommand {
    /// Record a reading session.
    Ingest {
        /// User ID.
        user: String,
        /// Book ID.
        book: String,
        /// Session start (RFC 3339).
        #[arg(long)]
        started_at: DateTime<Utc>,
        /// Session end (RFC 3339).
        #[arg(long)]
        ended_at: DateTime<Utc>,
        /// Pages turned during the session.
        #[arg(long, default_value = "0")]
        pages_delta: i64,
        /// Page shown at the end of the session.
        #[arg(long, default_value = "0")]
        current_page: i64,
        /// Percent of the book completed.
        #[arg(long, default_value = "0")]
        percent: f64,
        /// Reader that produced the session.
        #[arg(long, default_value = "manual")]
        source: LogSource,
    },

    /// Aggregate daily summaries.
    Aggregate {
        /// Single day to aggregate (YYYY-MM-DD); defaults to the lookback window.
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Print weekly KPIs and the recent series for a user.
    Summary {
        /// User ID.
        user: String,
        /// Number of days in the series.
        #[arg(long, default_value = "14")]
        days: u32,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Site-wide streak rule defaults.
    #[serde(default)]
    pub streaks: StreakDefaults,

    /// Scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Analytics configuration.
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/streaks.db")
}

/// Streak rule applied to users without a rule of their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreakDefaults {
    /// Metric compared against the daily target.
    #[serde(default)]
    pub daily_target_type: TargetType,

    /// Daily target value.
    #[serde(default)]
    pub daily_target_value: f64,

    /// Consecutive misses tolerated before a streak breaks.
    #[serde(default)]
    pub grace_days: u32,

    /// IANA timezone name.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Optional evaluation floor.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
}

impl Default for StreakDefaults {
    fn default() -> Self {
        Self {
            daily_target_type: TargetType::default(),
            daily_target_value: 0.0,
            grace_days: 0,
            timezone: default_timezone(),
            start_date: None,
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tick interval in seconds (0 to disable the loop).
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    /// Number of parallel evaluation workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Deliveries before a failing item is dropped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before a failed item is redelivered.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: i64,

    /// Queue items claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            retry_delay_seconds: default_retry_delay(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_interval() -> u64 {
    3600
}

fn default_workers() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay() -> i64 {
    300
}

fn default_batch_size() -> u32 {
    100
}

/// Analytics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Accept reading events at all.
    #[serde(default = "default_telemetry_enabled")]
    pub telemetry_enabled: bool,

    /// Consent assumed for users who never chose.
    #[serde(default = "default_user_opt_in")]
    pub default_user_opt_in: bool,

    /// Minimum gap between two events on the same book.
    #[serde(default = "default_debounce")]
    pub debounce_seconds: i64,

    /// Days re-aggregated on every tick (1 to 365).
    #[serde(default = "default_lookback")]
    pub aggregation_lookback_days: u32,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            telemetry_enabled: default_telemetry_enabled(),
            default_user_opt_in: default_user_opt_in(),
            debounce_seconds: default_debounce(),
            aggregation_lookback_days: default_lookback(),
        }
    }
}

fn default_telemetry_enabled() -> bool {
    true
}

fn default_user_opt_in() -> bool {
    true
}

fn default_debounce() -> i64 {
    5
}

fn default_lookback() -> u32 {
    30
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("readstreak.toml"),
            dirs::config_dir()
                .map(|p| p.join("readstreak").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/readstreak/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# readstreak configuration

[database]
# path = "/var/lib/readstreak/streaks.db"

[streaks]
# Rule used for users without a rule of their own
# Target type: "pages", "minutes" or "percent"
daily_target_type = "pages"
daily_target_value = 10
grace_days = 1
timezone = "UTC"
# start_date = "2024-01-01"

[scheduler]
# Tick interval in seconds (0 to disable)
interval_seconds = 3600
workers = 1
max_attempts = 5
retry_delay_seconds = 300
batch_size = 100

[analytics]
telemetry_enabled = true
# Consent for users who never set their own
default_user_opt_in = true
debounce_seconds = 5
# Days re-aggregated on every tick (1 to 365)
aggregation_lookback_days = 30
"#
        .to_string()
    }
}

/// Metric a daily target is measured in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// Pages read.
    #[default]
    Pages,
    /// Minutes read.
    Minutes,
    /// Percent of the book completed.
    Percent,
}

impl TargetType {
    /// Storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Pages => "pages",
            TargetType::Minutes => "minutes",
            TargetType::Percent => "percent",
        }
    }

    /// Parse a stored name, falling back to pages.
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }
}

impl std::str::FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pages" => Ok(TargetType::Pages),
            "minutes" => Ok(TargetType::Minutes),
            "percent" => Ok(TargetType::Percent),
            other => Err(format!("unknown target type: {}", other)),
        }
    }
}

/// Origin of a reading log or event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogSource {
    /// Entered by hand.
    #[default]
    Manual,
    /// In-browser PDF reader.
    PdfReader,
    /// In-browser EPUB reader.
    EpubReader,
}

impl LogSource {
    /// Storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Manual => "manual",
            LogSource::PdfReader => "pdf-reader",
            LogSource::EpubReader => "epub-reader",
        }
    }

    /// Parse a stored or submitted name; unknown sources count as manual.
    pub fn sanitize(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }
}

impl std::str::FromStr for LogSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(LogSource::Manual),
            "pdf-reader" => Ok(LogSource::PdfReader),
            "epub-reader" => Ok(LogSource::EpubReader),
            other => Err(format!("unknown source: {}", other)),
        }
    }
}
