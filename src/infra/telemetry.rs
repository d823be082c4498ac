use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "concierge_cache_local_hit_total",
            Unit::Count,
            "Total number of local tier hits."
        );
        describe_counter!(
            "concierge_cache_local_miss_total",
            Unit::Count,
            "Total number of local tier misses, expired entries included."
        );
        describe_counter!(
            "concierge_cache_local_evict_total",
            Unit::Count,
            "Total number of local tier evictions due to capacity."
        );
        describe_counter!(
            "concierge_cache_local_expired_total",
            Unit::Count,
            "Total number of local tier entries dropped after their TTL."
        );
        describe_gauge!(
            "concierge_cache_local_entries",
            Unit::Count,
            "Current number of entries held by the local tier."
        );
        describe_counter!(
            "concierge_cache_remote_hit_total",
            Unit::Count,
            "Total number of remote tier hits promoted into the local tier."
        );
        describe_counter!(
            "concierge_cache_remote_error_total",
            Unit::Count,
            "Total number of remote tier failures absorbed by the cache."
        );
        describe_counter!(
            "concierge_coalesce_joined_total",
            Unit::Count,
            "Total number of callers attached to an in-flight load."
        );
        describe_counter!(
            "concierge_coalesce_load_total",
            Unit::Count,
            "Total number of loader invocations."
        );
        describe_counter!(
            "concierge_coalesce_load_failed_total",
            Unit::Count,
            "Total number of loader invocations that failed or were abandoned."
        );
        describe_counter!(
            "concierge_pagination_limit_clamped_total",
            Unit::Count,
            "Total number of page requests whose limit was clamped."
        );
        describe_histogram!(
            "concierge_operation_ms",
            Unit::Milliseconds,
            "Monitored operation latency in milliseconds, labelled by source."
        );
    });
}
