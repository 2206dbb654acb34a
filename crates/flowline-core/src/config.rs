use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ADMIN_URL: &str = "http://127.0.0.1:8088";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 100;
pub const DEFAULT_BURST: u32 = 10;
pub const DEFAULT_FIRE_ATTEMPTS: u32 = 30;
pub const DEFAULT_FIRE_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SNAPSHOT_VERSION: u32 = 1;

/// Top-level config (flowline.toml + FLOWLINE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowlineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Downstream execution API the scheduler submits executions to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_url")]
    pub base_url: String,
    /// Upper bound for a single create-execution attempt.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Optional bearer token sent with every request.
    pub token: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            base_url: default_admin_url(),
            request_timeout_secs: default_request_timeout_secs(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often active schedules are reconciled against live timers.
    #[serde(default = "default_poll_interval_secs")]
    pub registerer_interval_secs: u64,
    /// How often the last-fired snapshot is persisted.
    #[serde(default = "default_poll_interval_secs")]
    pub checkpoint_interval_secs: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Envelope version used when writing snapshots. Reads accept every known version.
    #[serde(default = "default_snapshot_version")]
    pub snapshot_version: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            registerer_interval_secs: default_poll_interval_secs(),
            checkpoint_interval_secs: default_poll_interval_secs(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            snapshot_version: default_snapshot_version(),
        }
    }
}

/// Aggregate limit on create-execution calls, shared by catch-up and live fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_fire_attempts")]
    pub max_attempts: u32,
    /// Constant delay between attempts.
    #[serde(default = "default_fire_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_fire_attempts(),
            backoff_ms: default_fire_backoff_ms(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.flowline/flowline.db", home)
}
fn default_admin_url() -> String {
    DEFAULT_ADMIN_URL.to_string()
}
fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_requests_per_second() -> u32 {
    DEFAULT_REQUESTS_PER_SECOND
}
fn default_burst() -> u32 {
    DEFAULT_BURST
}
fn default_fire_attempts() -> u32 {
    DEFAULT_FIRE_ATTEMPTS
}
fn default_fire_backoff_ms() -> u64 {
    DEFAULT_FIRE_BACKOFF_MS
}
fn default_snapshot_version() -> u32 {
    DEFAULT_SNAPSHOT_VERSION
}

impl FlowlineConfig {
    /// Load config from a TOML file with FLOWLINE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `FLOWLINE_SCHEDULER__RATE_LIMIT__BURST=20`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("FLOWLINE_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .extract()
            .map_err(|e| crate::error::FlowlineError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.flowline/flowline.toml", home)
}
