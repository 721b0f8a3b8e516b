//! Configuration loading for the audience sync service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `AUDIENCE_SYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "AUDIENCE_SYNC_";

/// Application configuration derived from `AUDIENCE_SYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    /// Owners allowed to hold custom audiences; empty allows every owner.
    #[serde(default)]
    pub allowed_owners: Vec<String>,
    /// Buyers currently enrolled; empty treats every buyer as enrolled.
    #[serde(default)]
    pub enrolled_buyers: Vec<String>,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub background_fetch: BackgroundFetchConfig,
    #[serde(default)]
    pub scheduled_updates: ScheduledUpdatesConfig,
    #[serde(default)]
    pub limits: AudienceLimitsConfig,
    #[serde(default)]
    pub features: FeatureFlags,
}

/// Outbound HTTP settings shared by both fetch pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FetcherConfig {
    /// Connect timeout in milliseconds (default: 5000)
    #[serde(default = "default_fetch_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Read timeout in milliseconds (default: 30000)
    #[serde(default = "default_fetch_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Largest response body accepted from a buyer (default: 10240)
    #[serde(default = "default_fetch_max_response_size_bytes")]
    pub max_response_size_bytes: usize,
}

/// Background fetch job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct BackgroundFetchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between periodic runs in seconds (default: 3600)
    #[serde(default = "default_background_fetch_tick_seconds")]
    pub tick_seconds: u64,

    /// Hard deadline for a single run in seconds (default: 600)
    #[serde(default = "default_job_max_runtime_seconds")]
    pub max_runtime_seconds: u64,

    /// Maximum number of audiences updated per run (default: 1000)
    #[serde(default = "default_background_fetch_max_num_updated")]
    pub max_num_updated: u64,

    /// Upper bound on concurrent update batches (default: 8)
    #[serde(default = "default_background_fetch_max_workers")]
    pub max_workers: usize,

    /// Delay before an audience becomes eligible again, in seconds (default: 86400)
    #[serde(default = "default_background_fetch_update_interval_seconds")]
    pub update_interval_seconds: u64,
}

/// Scheduled update job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ScheduledUpdatesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between periodic runs in seconds (default: 3600)
    #[serde(default = "default_scheduled_updates_tick_seconds")]
    pub tick_seconds: u64,

    /// Hard deadline for a single run in seconds (default: 600)
    #[serde(default = "default_job_max_runtime_seconds")]
    pub max_runtime_seconds: u64,

    /// Lowest permitted delay for a schedule request in minutes (default: 30)
    #[serde(default = "default_min_delay_mins_override")]
    pub min_delay_mins_override: i64,

    /// Whether responses may carry further schedule requests (default: true)
    #[serde(default = "default_true")]
    pub additional_schedule_requests_enabled: bool,

    /// Pending updates older than this are discarded, in hours (default: 24)
    #[serde(default = "default_stale_update_age_hours")]
    pub stale_update_age_hours: u64,

    /// Schedule API permits per owner per second (default: 1.0)
    #[serde(default = "default_schedule_permits_per_second")]
    pub permits_per_second: f64,
}

/// Size, time and quantity limits applied to custom audiences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AudienceLimitsConfig {
    #[serde(default = "default_max_name_size_bytes")]
    pub max_name_size_bytes: usize,
    #[serde(default = "default_max_user_bidding_signals_size_bytes")]
    pub max_user_bidding_signals_size_bytes: usize,
    #[serde(default = "default_max_activation_delay_days")]
    pub max_activation_delay_days: i64,
    #[serde(default = "default_max_expire_in_days")]
    pub max_expire_in_days: i64,
    #[serde(default = "default_max_uri_size_bytes")]
    pub max_daily_update_uri_size_bytes: usize,
    #[serde(default = "default_max_uri_size_bytes")]
    pub max_bidding_logic_uri_size_bytes: usize,
    #[serde(default = "default_max_trusted_bidding_data_size_bytes")]
    pub max_trusted_bidding_data_size_bytes: usize,
    #[serde(default = "default_max_ads_size_bytes")]
    pub max_ads_size_bytes: usize,
    #[serde(default = "default_max_num_ads")]
    pub max_num_ads: usize,
    /// Serialized size ceiling for a fused audience.
    #[serde(default = "default_max_custom_audience_size_bytes")]
    pub max_custom_audience_size_bytes: usize,
    #[serde(default = "default_max_total_audiences")]
    pub max_total_audiences: u64,
    #[serde(default = "default_max_audiences_per_owner")]
    pub max_audiences_per_owner: u64,
    #[serde(default = "default_max_owner_count")]
    pub max_owner_count: u64,
    #[serde(default = "default_ad_render_id_max_length")]
    pub ad_render_id_max_length: usize,
}

/// Feature switches that change which fields are read and which checks run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FeatureFlags {
    #[serde(default)]
    pub frequency_cap_filtering: bool,
    #[serde(default)]
    pub app_install_filtering: bool,
    #[serde(default)]
    pub ad_render_id: bool,
    #[serde(default)]
    pub auction_server_request_flags: bool,
    /// Enables the `priority` field.
    #[serde(default)]
    pub seller_configuration: bool,
    /// Trust the update URI host instead of requiring an enrolled buyer.
    #[serde(default)]
    pub enrollment_check_disabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            allowed_owners: Vec::new(),
            enrolled_buyers: Vec::new(),
            fetcher: FetcherConfig::default(),
            background_fetch: BackgroundFetchConfig::default(),
            scheduled_updates: ScheduledUpdatesConfig::default(),
            limits: AudienceLimitsConfig::default(),
            features: FeatureFlags::default(),
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_fetch_connect_timeout_ms(),
            read_timeout_ms: default_fetch_read_timeout_ms(),
            max_response_size_bytes: default_fetch_max_response_size_bytes(),
        }
    }
}

impl Default for BackgroundFetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_seconds: default_background_fetch_tick_seconds(),
            max_runtime_seconds: default_job_max_runtime_seconds(),
            max_num_updated: default_background_fetch_max_num_updated(),
            max_workers: default_background_fetch_max_workers(),
            update_interval_seconds: default_background_fetch_update_interval_seconds(),
        }
    }
}

impl Default for ScheduledUpdatesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_seconds: default_scheduled_updates_tick_seconds(),
            max_runtime_seconds: default_job_max_runtime_seconds(),
            min_delay_mins_override: default_min_delay_mins_override(),
            additional_schedule_requests_enabled: true,
            stale_update_age_hours: default_stale_update_age_hours(),
            permits_per_second: default_schedule_permits_per_second(),
        }
    }
}

impl Default for AudienceLimitsConfig {
    fn default() -> Self {
        Self {
            max_name_size_bytes: default_max_name_size_bytes(),
            max_user_bidding_signals_size_bytes: default_max_user_bidding_signals_size_bytes(),
            max_activation_delay_days: default_max_activation_delay_days(),
            max_expire_in_days: default_max_expire_in_days(),
            max_daily_update_uri_size_bytes: default_max_uri_size_bytes(),
            max_bidding_logic_uri_size_bytes: default_max_uri_size_bytes(),
            max_trusted_bidding_data_size_bytes: default_max_trusted_bidding_data_size_bytes(),
            max_ads_size_bytes: default_max_ads_size_bytes(),
            max_num_ads: default_max_num_ads(),
            max_custom_audience_size_bytes: default_max_custom_audience_size_bytes(),
            max_total_audiences: default_max_total_audiences(),
            max_audiences_per_owner: default_max_audiences_per_owner(),
            max_owner_count: default_max_owner_count(),
            ad_render_id_max_length: default_ad_render_id_max_length(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec!["[REDACTED]".to_string()];
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning the first violated bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Local and test profiles may run without operator tokens
        if !matches!(self.profile.as_str(), "local" | "test") && self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        self.fetcher.validate()?;
        self.background_fetch.validate()?;
        self.scheduled_updates.validate()?;
        self.limits.validate()?;

        Ok(())
    }
}

impl FetcherConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Validate fetcher bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 || self.connect_timeout_ms > 60_000 {
            return Err(ConfigError::InvalidFetchTimeout {
                field: "connect",
                value: self.connect_timeout_ms,
            });
        }
        if self.read_timeout_ms == 0 || self.read_timeout_ms > 120_000 {
            return Err(ConfigError::InvalidFetchTimeout {
                field: "read",
                value: self.read_timeout_ms,
            });
        }
        if self.max_response_size_bytes == 0 {
            return Err(ConfigError::InvalidMaxResponseSize {
                value: self.max_response_size_bytes,
            });
        }
        Ok(())
    }
}

impl BackgroundFetchConfig {
    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_seconds)
    }

    /// Validate background fetch bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_seconds < 60 {
            return Err(ConfigError::InvalidTickInterval {
                job: "background fetch",
                value: self.tick_seconds,
            });
        }
        if self.max_runtime_seconds == 0 || self.max_runtime_seconds > 3600 {
            return Err(ConfigError::InvalidMaxRuntime {
                job: "background fetch",
                value: self.max_runtime_seconds,
            });
        }
        if self.max_num_updated == 0 {
            return Err(ConfigError::InvalidMaxNumUpdated {
                value: self.max_num_updated,
            });
        }
        if self.max_workers == 0 || self.max_workers > 64 {
            return Err(ConfigError::InvalidMaxWorkers {
                value: self.max_workers,
            });
        }
        if self.update_interval_seconds < 60 {
            return Err(ConfigError::InvalidUpdateInterval {
                value: self.update_interval_seconds,
            });
        }
        Ok(())
    }
}

impl ScheduledUpdatesConfig {
    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_seconds)
    }

    /// Validate scheduled update bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_seconds < 60 {
            return Err(ConfigError::InvalidTickInterval {
                job: "scheduled updates",
                value: self.tick_seconds,
            });
        }
        if self.max_runtime_seconds == 0 || self.max_runtime_seconds > 3600 {
            return Err(ConfigError::InvalidMaxRuntime {
                job: "scheduled updates",
                value: self.max_runtime_seconds,
            });
        }
        if !(0..=crate::schedule_update::MAX_DELAY_MINUTES).contains(&self.min_delay_mins_override)
        {
            return Err(ConfigError::InvalidMinDelayOverride {
                value: self.min_delay_mins_override,
            });
        }
        if self.stale_update_age_hours == 0 {
            return Err(ConfigError::InvalidStaleUpdateAge {
                value: self.stale_update_age_hours,
            });
        }
        if !(self.permits_per_second > 0.0) {
            return Err(ConfigError::InvalidPermitsPerSecond {
                value: self.permits_per_second,
            });
        }
        Ok(())
    }
}

impl AudienceLimitsConfig {
    /// Validate that every limit is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("MAX_NAME_SIZE_BYTES", self.max_name_size_bytes),
            (
                "MAX_USER_BIDDING_SIGNALS_SIZE_BYTES",
                self.max_user_bidding_signals_size_bytes,
            ),
            (
                "MAX_DAILY_UPDATE_URI_SIZE_BYTES",
                self.max_daily_update_uri_size_bytes,
            ),
            (
                "MAX_BIDDING_LOGIC_URI_SIZE_BYTES",
                self.max_bidding_logic_uri_size_bytes,
            ),
            (
                "MAX_TRUSTED_BIDDING_DATA_SIZE_BYTES",
                self.max_trusted_bidding_data_size_bytes,
            ),
            ("MAX_ADS_SIZE_BYTES", self.max_ads_size_bytes),
            ("MAX_NUM_ADS", self.max_num_ads),
            (
                "MAX_CUSTOM_AUDIENCE_SIZE_BYTES",
                self.max_custom_audience_size_bytes,
            ),
            ("AD_RENDER_ID_MAX_LENGTH", self.ad_render_id_max_length),
        ];
        for (field, value) in sizes {
            if value == 0 {
                return Err(ConfigError::InvalidLimit {
                    field,
                    value: value as u64,
                });
            }
        }

        if self.max_activation_delay_days <= 0 || self.max_expire_in_days <= 0 {
            return Err(ConfigError::InvalidLimit {
                field: "MAX_ACTIVATION_DELAY_DAYS/MAX_EXPIRE_IN_DAYS",
                value: self.max_activation_delay_days.min(self.max_expire_in_days).max(0) as u64,
            });
        }

        if self.max_audiences_per_owner > self.max_total_audiences {
            return Err(ConfigError::InvalidQuantityLimits {
                per_owner: self.max_audiences_per_owner,
                total: self.max_total_audiences,
            });
        }

        Ok(())
    }

    pub fn max_activation_delay(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_activation_delay_days)
    }

    pub fn max_expire_in(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_expire_in_days)
    }
}

fn default_true() -> bool {
    true
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://audience_sync.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_fetch_connect_timeout_ms() -> u64 {
    5000
}

fn default_fetch_read_timeout_ms() -> u64 {
    30_000
}

fn default_fetch_max_response_size_bytes() -> usize {
    10 * 1024
}

fn default_background_fetch_tick_seconds() -> u64 {
    3600 // 1 hour
}

fn default_job_max_runtime_seconds() -> u64 {
    600 // 10 minutes
}

fn default_background_fetch_max_num_updated() -> u64 {
    1000
}

fn default_background_fetch_max_workers() -> usize {
    8
}

fn default_background_fetch_update_interval_seconds() -> u64 {
    86400 // 24 hours
}

fn default_scheduled_updates_tick_seconds() -> u64 {
    3600 // 1 hour
}

fn default_min_delay_mins_override() -> i64 {
    30
}

fn default_stale_update_age_hours() -> u64 {
    24
}

fn default_schedule_permits_per_second() -> f64 {
    1.0
}

fn default_max_name_size_bytes() -> usize {
    200
}

fn default_max_user_bidding_signals_size_bytes() -> usize {
    10 * 1024
}

fn default_max_activation_delay_days() -> i64 {
    60
}

fn default_max_expire_in_days() -> i64 {
    60
}

fn default_max_uri_size_bytes() -> usize {
    400
}

fn default_max_trusted_bidding_data_size_bytes() -> usize {
    10 * 1024
}

fn default_max_ads_size_bytes() -> usize {
    10 * 1024
}

fn default_max_num_ads() -> usize {
    100
}

fn default_max_custom_audience_size_bytes() -> usize {
    64 * 1024
}

fn default_max_total_audiences() -> u64 {
    4000
}

fn default_max_audiences_per_owner() -> u64 {
    1000
}

fn default_max_owner_count() -> u64 {
    1000
}

fn default_ad_render_id_max_length() -> usize {
    12
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error(
        "no operator tokens configured; set AUDIENCE_SYNC_OPERATOR_TOKEN or AUDIENCE_SYNC_OPERATOR_TOKENS"
    )]
    MissingOperatorTokens,
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("{field} timeout must be between 1 and the allowed maximum milliseconds, got {value}")]
    InvalidFetchTimeout { field: &'static str, value: u64 },
    #[error("max response size must be positive, got {value}")]
    InvalidMaxResponseSize { value: usize },
    #[error("{job} tick interval must be at least 60 seconds, got {value}")]
    InvalidTickInterval { job: &'static str, value: u64 },
    #[error("{job} max runtime must be between 1 and 3600 seconds, got {value}")]
    InvalidMaxRuntime { job: &'static str, value: u64 },
    #[error("background fetch max updated audiences must be positive, got {value}")]
    InvalidMaxNumUpdated { value: u64 },
    #[error("background fetch max workers must be between 1 and 64, got {value}")]
    InvalidMaxWorkers { value: usize },
    #[error("background fetch update interval must be at least 60 seconds, got {value}")]
    InvalidUpdateInterval { value: u64 },
    #[error("min delay override must be between 0 and 300 minutes, got {value}")]
    InvalidMinDelayOverride { value: i64 },
    #[error("stale update age must be at least 1 hour, got {value}")]
    InvalidStaleUpdateAge { value: u64 },
    #[error("schedule permits per second must be positive, got {value}")]
    InvalidPermitsPerSecond { value: f64 },
    #[error("audience limit {field} must be positive, got {value}")]
    InvalidLimit { field: &'static str, value: u64 },
    #[error("per-owner audience limit ({per_owner}) cannot exceed total limit ({total})")]
    InvalidQuantityLimits { per_owner: u64, total: u64 },
}

/// Loads configuration using layered `.env` files and `AUDIENCE_SYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration; the process environment overrides every file layer.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        // Support both a single token and a comma-separated list
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            split_list(&tokens)
        } else if let Some(token) = layered.remove("OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };
        let allowed_owners = layered
            .remove("ALLOWED_OWNERS")
            .map(|v| split_list(&v))
            .unwrap_or_default();
        let enrolled_buyers = layered
            .remove("ENROLLED_BUYERS")
            .map(|v| split_list(&v))
            .unwrap_or_default();

        let fetcher = FetcherConfig {
            connect_timeout_ms: layered
                .remove("FETCH_CONNECT_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_fetch_connect_timeout_ms),
            read_timeout_ms: layered
                .remove("FETCH_READ_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_fetch_read_timeout_ms),
            max_response_size_bytes: layered
                .remove("FETCH_MAX_RESPONSE_SIZE_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_fetch_max_response_size_bytes),
        };

        let background_fetch = BackgroundFetchConfig {
            enabled: layered
                .remove("BACKGROUND_FETCH_ENABLED")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_true),
            tick_seconds: layered
                .remove("BACKGROUND_FETCH_TICK_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_background_fetch_tick_seconds),
            max_runtime_seconds: layered
                .remove("BACKGROUND_FETCH_MAX_RUNTIME_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_job_max_runtime_seconds),
            max_num_updated: layered
                .remove("BACKGROUND_FETCH_MAX_NUM_UPDATED")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_background_fetch_max_num_updated),
            max_workers: layered
                .remove("BACKGROUND_FETCH_MAX_WORKERS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_background_fetch_max_workers),
            update_interval_seconds: layered
                .remove("BACKGROUND_FETCH_UPDATE_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_background_fetch_update_interval_seconds),
        };

        let scheduled_updates = ScheduledUpdatesConfig {
            enabled: layered
                .remove("SCHEDULED_UPDATES_ENABLED")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_true),
            tick_seconds: layered
                .remove("SCHEDULED_UPDATES_TICK_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduled_updates_tick_seconds),
            max_runtime_seconds: layered
                .remove("SCHEDULED_UPDATES_MAX_RUNTIME_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_job_max_runtime_seconds),
            min_delay_mins_override: layered
                .remove("SCHEDULED_UPDATES_MIN_DELAY_MINS_OVERRIDE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_min_delay_mins_override),
            additional_schedule_requests_enabled: layered
                .remove("SCHEDULED_UPDATES_ADDITIONAL_REQUESTS_ENABLED")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_true),
            stale_update_age_hours: layered
                .remove("SCHEDULED_UPDATES_STALE_AGE_HOURS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_stale_update_age_hours),
            permits_per_second: layered
                .remove("SCHEDULED_UPDATES_PERMITS_PER_SECOND")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_schedule_permits_per_second),
        };

        let limits = AudienceLimitsConfig {
            max_name_size_bytes: layered
                .remove("LIMIT_MAX_NAME_SIZE_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_name_size_bytes),
            max_user_bidding_signals_size_bytes: layered
                .remove("LIMIT_MAX_USER_BIDDING_SIGNALS_SIZE_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_user_bidding_signals_size_bytes),
            max_activation_delay_days: layered
                .remove("LIMIT_MAX_ACTIVATION_DELAY_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_activation_delay_days),
            max_expire_in_days: layered
                .remove("LIMIT_MAX_EXPIRE_IN_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_expire_in_days),
            max_daily_update_uri_size_bytes: layered
                .remove("LIMIT_MAX_DAILY_UPDATE_URI_SIZE_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_uri_size_bytes),
            max_bidding_logic_uri_size_bytes: layered
                .remove("LIMIT_MAX_BIDDING_LOGIC_URI_SIZE_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_uri_size_bytes),
            max_trusted_bidding_data_size_bytes: layered
                .remove("LIMIT_MAX_TRUSTED_BIDDING_DATA_SIZE_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_trusted_bidding_data_size_bytes),
            max_ads_size_bytes: layered
                .remove("LIMIT_MAX_ADS_SIZE_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_ads_size_bytes),
            max_num_ads: layered
                .remove("LIMIT_MAX_NUM_ADS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_num_ads),
            max_custom_audience_size_bytes: layered
                .remove("LIMIT_MAX_CUSTOM_AUDIENCE_SIZE_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_custom_audience_size_bytes),
            max_total_audiences: layered
                .remove("LIMIT_MAX_TOTAL_AUDIENCES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_total_audiences),
            max_audiences_per_owner: layered
                .remove("LIMIT_MAX_AUDIENCES_PER_OWNER")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_audiences_per_owner),
            max_owner_count: layered
                .remove("LIMIT_MAX_OWNER_COUNT")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_owner_count),
            ad_render_id_max_length: layered
                .remove("LIMIT_AD_RENDER_ID_MAX_LENGTH")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_ad_render_id_max_length),
        };

        let mut flag = |key: &str| {
            layered
                .remove(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(false)
        };
        let features = FeatureFlags {
            frequency_cap_filtering: flag("FEATURE_FREQUENCY_CAP_FILTERING"),
            app_install_filtering: flag("FEATURE_APP_INSTALL_FILTERING"),
            ad_render_id: flag("FEATURE_AD_RENDER_ID"),
            auction_server_request_flags: flag("FEATURE_AUCTION_SERVER_REQUEST_FLAGS"),
            seller_configuration: flag("FEATURE_SELLER_CONFIGURATION"),
            enrollment_check_disabled: flag("FEATURE_ENROLLMENT_CHECK_DISABLED"),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            allowed_owners,
            enrolled_buyers,
            fetcher,
            background_fetch,
            scheduled_updates,
            limits,
            features,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
