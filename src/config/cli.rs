use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

const DEFAULT_PROBE_REQUESTS: u32 = 3;

/// Command-line arguments for the Concierge binary.
#[derive(Debug, Parser)]
#[command(
    name = "concierge",
    version,
    about = "Concierge data-access acceleration layer"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CONCIERGE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Initialize the layer, probe the cache and print aggregate stats.
    Check(CheckArgs),
}

impl Default for Command {
    fn default() -> Self {
        Self::Check(CheckArgs::default())
    }
}

#[derive(Debug, Args, Clone)]
pub struct CheckArgs {
    #[command(flatten)]
    pub overrides: SettingsOverrides,

    /// Number of synthetic list requests issued against the pagination engine.
    #[arg(long = "probe-requests", default_value_t = DEFAULT_PROBE_REQUESTS, value_name = "COUNT")]
    pub probe_requests: u32,
}

impl Default for CheckArgs {
    fn default() -> Self {
        Self {
            overrides: SettingsOverrides::default(),
            probe_requests: DEFAULT_PROBE_REQUESTS,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct SettingsOverrides {
    /// Override the runtime environment (development|production).
    #[arg(long = "environment", value_name = "MODE")]
    pub environment: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the remote cache connection string.
    #[arg(long = "cache-remote-url", value_name = "URL")]
    pub cache_remote_url: Option<String>,

    /// Override the default cache TTL.
    #[arg(long = "cache-default-ttl-seconds", value_name = "SECONDS")]
    pub cache_default_ttl_seconds: Option<u64>,

    /// Override the local tier capacity.
    #[arg(long = "cache-max-entries", value_name = "COUNT")]
    pub cache_max_entries: Option<u64>,

    /// Override the expired-entry sweep interval; 0 disables sweeping.
    #[arg(long = "cache-sweep-interval-seconds", value_name = "SECONDS")]
    pub cache_sweep_interval_seconds: Option<u64>,

    /// Override the maximum page size.
    #[arg(long = "pagination-max-limit", value_name = "COUNT")]
    pub pagination_max_limit: Option<u64>,

    /// Override the slow operation threshold.
    #[arg(long = "monitor-slow-threshold-ms", value_name = "MILLIS")]
    pub monitor_slow_threshold_ms: Option<u64>,
}
