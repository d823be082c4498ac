//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{CheckArgs, CliArgs, Command, SettingsOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "concierge";
const ENV_PREFIX: &str = "CONCIERGE";

const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_MAX_ENTRIES: u64 = 1000;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_KEY_PREFIX: &str = "concierge:";
const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 250;
const DEFAULT_PAGE_LIMIT: u64 = 20;
const DEFAULT_MAX_PAGE_LIMIT: u64 = 100;
const DEFAULT_SLOW_THRESHOLD_MS: u64 = 500;
const DEFAULT_SAMPLE_LIMIT: u64 = 1000;
const DEFAULT_SLOW_SAMPLE_LIMIT: u64 = 100;
const DEFAULT_SLOW_REPORT_LIMIT: u64 = 10;
const DEFAULT_REPETITION_THRESHOLD: u64 = 10;
const DEFAULT_REPETITION_WINDOW: u64 = 100;

const REMOTE_URL_SCHEMES: [&str; 3] = ["redis://", "rediss://", "unix://"];

#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: RuntimeEnvironment,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub pagination: PaginationSettings,
    pub monitor: MonitorSettings,
}

/// Deployment mode. The shared remote tier is only used in production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnvironment {
    Development,
    Production,
}

impl RuntimeEnvironment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

impl FromStr for RuntimeEnvironment {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!(
                "unknown environment `{other}`, expected `development` or `production`"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub default_ttl: Duration,
    pub max_entries: NonZeroUsize,
    /// `None` when periodic sweeping is disabled.
    pub sweep_interval: Option<Duration>,
    pub remote_url: Option<String>,
    /// True when a remote URL is configured and the environment permits it.
    pub remote_enabled: bool,
    pub key_prefix: String,
    /// Upper bound on a single remote tier command.
    pub remote_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PaginationSettings {
    pub default_limit: NonZeroU32,
    pub max_limit: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub slow_threshold: Duration,
    pub sample_limit: NonZeroUsize,
    pub slow_sample_limit: NonZeroUsize,
    pub slow_report_limit: NonZeroUsize,
    pub repetition_threshold: NonZeroUsize,
    pub repetition_window: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Parse command-line arguments and load settings for them.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Check(args)) => raw.apply_overrides(&args.overrides),
        None => raw.apply_overrides(&SettingsOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    environment: Option<String>,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    pagination: RawPaginationSettings,
    monitor: RawMonitorSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    remote_url: Option<String>,
    default_ttl_seconds: Option<u64>,
    max_entries: Option<u64>,
    sweep_interval_seconds: Option<u64>,
    key_prefix: Option<String>,
    remote_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPaginationSettings {
    default_limit: Option<u64>,
    max_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMonitorSettings {
    slow_threshold_ms: Option<u64>,
    sample_limit: Option<u64>,
    slow_sample_limit: Option<u64>,
    slow_report_limit: Option<u64>,
    repetition_threshold: Option<u64>,
    repetition_window: Option<u64>,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &SettingsOverrides) {
        if let Some(environment) = overrides.environment.as_ref() {
            self.environment = Some(environment.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.cache_remote_url.as_ref() {
            self.cache.remote_url = Some(url.clone());
        }
        if let Some(seconds) = overrides.cache_default_ttl_seconds {
            self.cache.default_ttl_seconds = Some(seconds);
        }
        if let Some(max) = overrides.cache_max_entries {
            self.cache.max_entries = Some(max);
        }
        if let Some(seconds) = overrides.cache_sweep_interval_seconds {
            self.cache.sweep_interval_seconds = Some(seconds);
        }
        if let Some(max) = overrides.pagination_max_limit {
            self.pagination.max_limit = Some(max);
        }
        if let Some(millis) = overrides.monitor_slow_threshold_ms {
            self.monitor.slow_threshold_ms = Some(millis);
        }
    }
}

impl Settings {
    /// Built-in defaults with `overrides` applied, ignoring files and the
    /// environment.
    pub fn with_overrides(overrides: &SettingsOverrides) -> Result<Self, LoadError> {
        let mut raw = RawSettings::default();
        raw.apply_overrides(overrides);
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            environment,
            logging,
            cache,
            pagination,
            monitor,
        } = raw;

        let environment = build_environment(environment)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache, environment)?;
        let pagination = build_pagination_settings(pagination)?;
        let monitor = build_monitor_settings(monitor)?;

        Ok(Self {
            environment,
            logging,
            cache,
            pagination,
            monitor,
        })
    }
}

fn build_environment(environment: Option<String>) -> Result<RuntimeEnvironment, LoadError> {
    match environment {
        Some(value) => {
            RuntimeEnvironment::from_str(&value).map_err(|reason| LoadError::invalid("environment", reason))
        }
        None => Ok(RuntimeEnvironment::Development),
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(
    cache: RawCacheSettings,
    environment: RuntimeEnvironment,
) -> Result<CacheSettings, LoadError> {
    let remote_url = cache.remote_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if let Some(url) = remote_url.as_deref()
        && !REMOTE_URL_SCHEMES
            .iter()
            .any(|scheme| url.starts_with(scheme))
    {
        return Err(LoadError::invalid(
            "cache.remote_url",
            format!("expected one of {REMOTE_URL_SCHEMES:?}"),
        ));
    }
    let remote_enabled = remote_url.is_some() && environment == RuntimeEnvironment::Production;

    let ttl_secs = cache.default_ttl_seconds.unwrap_or(DEFAULT_TTL_SECS);
    if ttl_secs == 0 {
        return Err(LoadError::invalid(
            "cache.default_ttl_seconds",
            "must be greater than zero",
        ));
    }

    let max_entries = non_zero_usize(
        cache.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES),
        "cache.max_entries",
    )?;

    let sweep_secs = cache
        .sweep_interval_seconds
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
    let sweep_interval = (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs));

    let key_prefix = cache
        .key_prefix
        .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());

    let timeout_ms = cache.remote_timeout_ms.unwrap_or(DEFAULT_REMOTE_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.remote_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        default_ttl: Duration::from_secs(ttl_secs),
        max_entries,
        sweep_interval,
        remote_url,
        remote_enabled,
        key_prefix,
        remote_timeout: Duration::from_millis(timeout_ms),
    })
}

fn build_pagination_settings(
    pagination: RawPaginationSettings,
) -> Result<PaginationSettings, LoadError> {
    let default_limit = non_zero_u32(
        pagination.default_limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        "pagination.default_limit",
    )?;
    let max_limit = non_zero_u32(
        pagination.max_limit.unwrap_or(DEFAULT_MAX_PAGE_LIMIT),
        "pagination.max_limit",
    )?;
    if default_limit > max_limit {
        return Err(LoadError::invalid(
            "pagination.default_limit",
            format!("must not exceed pagination.max_limit ({max_limit})"),
        ));
    }

    Ok(PaginationSettings {
        default_limit,
        max_limit,
    })
}

fn build_monitor_settings(monitor: RawMonitorSettings) -> Result<MonitorSettings, LoadError> {
    let slow_ms = monitor
        .slow_threshold_ms
        .unwrap_or(DEFAULT_SLOW_THRESHOLD_MS);
    if slow_ms == 0 {
        return Err(LoadError::invalid(
            "monitor.slow_threshold_ms",
            "must be greater than zero",
        ));
    }

    Ok(MonitorSettings {
        slow_threshold: Duration::from_millis(slow_ms),
        sample_limit: non_zero_usize(
            monitor.sample_limit.unwrap_or(DEFAULT_SAMPLE_LIMIT),
            "monitor.sample_limit",
        )?,
        slow_sample_limit: non_zero_usize(
            monitor.slow_sample_limit.unwrap_or(DEFAULT_SLOW_SAMPLE_LIMIT),
            "monitor.slow_sample_limit",
        )?,
        slow_report_limit: non_zero_usize(
            monitor.slow_report_limit.unwrap_or(DEFAULT_SLOW_REPORT_LIMIT),
            "monitor.slow_report_limit",
        )?,
        repetition_threshold: non_zero_usize(
            monitor
                .repetition_threshold
                .unwrap_or(DEFAULT_REPETITION_THRESHOLD),
            "monitor.repetition_threshold",
        )?,
        repetition_window: non_zero_usize(
            monitor.repetition_window.unwrap_or(DEFAULT_REPETITION_WINDOW),
            "monitor.repetition_window",
        )?,
    })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    let value = u32::try_from(value)
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value = usize::try_from(value)
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
