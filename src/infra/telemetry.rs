use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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

/// Register descriptions for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "quire_cache_hit_total",
            Unit::Count,
            "Total number of requests served from the response cache."
        );
        describe_counter!(
            "quire_cache_miss_total",
            Unit::Count,
            "Total number of cache lookups that ran the handler."
        );
        describe_counter!(
            "quire_cache_skip_total",
            Unit::Count,
            "Total number of requests that bypassed the cache, by reason."
        );
        describe_counter!(
            "quire_cache_fill_total",
            Unit::Count,
            "Total number of responses written back to the cache."
        );
        describe_counter!(
            "quire_cache_evict_total",
            Unit::Count,
            "Total number of memory-store entries evicted due to capacity."
        );
        describe_counter!(
            "quire_cache_store_error_total",
            Unit::Count,
            "Total number of failed cache store operations, by operation."
        );
        describe_counter!(
            "quire_cache_invalidation_total",
            Unit::Count,
            "Total number of invalidation messages applied, by kind."
        );
        describe_counter!(
            "quire_bus_publish_error_total",
            Unit::Count,
            "Total number of invalidation messages that failed to publish."
        );
        describe_histogram!(
            "quire_cache_lookup_ms",
            Unit::Milliseconds,
            "Cache lookup latency in milliseconds."
        );
    });
}
