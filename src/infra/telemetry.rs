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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "dyncache_cache_fresh_hit_total",
            Unit::Count,
            "Total number of requests served from a fresh entry."
        );
        describe_counter!(
            "dyncache_cache_stale_hit_total",
            Unit::Count,
            "Total number of requests served from a stale entry."
        );
        describe_counter!(
            "dyncache_cache_miss_total",
            Unit::Count,
            "Total number of requests that missed both entries."
        );
        describe_counter!(
            "dyncache_refresh_total",
            Unit::Count,
            "Total number of background refreshes that stored both entries."
        );
        describe_counter!(
            "dyncache_refresh_failed_total",
            Unit::Count,
            "Total number of background refreshes that failed."
        );
        describe_counter!(
            "dyncache_refresh_skipped_total",
            Unit::Count,
            "Total number of background refreshes the origin answered with an uncacheable response."
        );
        describe_counter!(
            "dyncache_refresh_collapsed_total",
            Unit::Count,
            "Total number of refreshes skipped because one was already in flight."
        );
        describe_counter!(
            "dyncache_invalidate_total",
            Unit::Count,
            "Total number of explicit invalidations."
        );
        describe_counter!(
            "dyncache_passthrough_total",
            Unit::Count,
            "Total number of uncached pass-through requests."
        );
        describe_counter!(
            "dyncache_store_evict_total",
            Unit::Count,
            "Total number of in-memory store evictions due to capacity."
        );
        describe_histogram!(
            "dyncache_origin_fetch_ms",
            Unit::Milliseconds,
            "Origin fetch latency in milliseconds."
        );
    });
}
