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

const FILTER_ENV: &str = "OGSYNC_LOG";

/// Install the global tracing subscriber. Events go to stderr; `OGSYNC_LOG`
/// directives refine the configured level.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
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
            "ogsync_render_total",
            Unit::Count,
            "Card renders by result."
        );
        describe_histogram!(
            "ogsync_render_ms",
            Unit::Milliseconds,
            "Card render latency in milliseconds."
        );
        describe_counter!(
            "ogsync_batch_skipped_total",
            Unit::Count,
            "Render tasks skipped because the artifact already existed."
        );
        describe_counter!(
            "ogsync_sync_total",
            Unit::Count,
            "Sync runs by outcome (completed, dropped, failed)."
        );
        describe_histogram!(
            "ogsync_sync_ms",
            Unit::Milliseconds,
            "Sync run latency in milliseconds."
        );
        describe_counter!(
            "ogsync_sweep_deleted_total",
            Unit::Count,
            "Orphaned artifacts deleted by the sweeper."
        );
    });
}
