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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "gazette_store_retry_total",
            Unit::Count,
            "Store operations retried after a transient failure."
        );
        describe_counter!(
            "gazette_store_exhausted_total",
            Unit::Count,
            "Store operations that used up every attempt."
        );
        describe_counter!(
            "gazette_store_fallback_total",
            Unit::Count,
            "Exhausted store operations answered with a fallback value."
        );
        describe_counter!(
            "gazette_coherence_invalidation_total",
            Unit::Count,
            "Local invalidations published to other contexts."
        );
        describe_counter!(
            "gazette_coherence_message_ignored_total",
            Unit::Count,
            "Incoming invalidation messages ignored by token comparison or origin."
        );
        describe_counter!(
            "gazette_coherence_delivery_failed_total",
            Unit::Count,
            "Invalidation messages the transport failed to deliver."
        );
        describe_histogram!(
            "gazette_orchestrator_converge_ms",
            Unit::Milliseconds,
            "Time from local invalidation to verified convergence, in milliseconds."
        );
    });
}
