//! Pipeline metrics.
//!
//! Instruments are created from the global OpenTelemetry meter. If
//! [`initialize_metrics`] was never called they are no-ops, so
//! components can always record.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry_sdk::metrics::Aggregation;
use opentelemetry_sdk::metrics::Instrument;
use opentelemetry_sdk::metrics::MeterProvider;
use opentelemetry_sdk::metrics::Stream;
use prometheus::default_registry;

use crate::errors::JoinerError;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> Result<(), JoinerError> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("rewardjoin")
        .build()
        .map_err(|err| JoinerError::Telemetry(err.to_string()))?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| JoinerError::Telemetry(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Instruments shared by the pipeline components.
#[derive(Clone)]
pub struct JoinerMetrics {
    pub billed_events: Counter<u64>,
    pub joined_interactions: Counter<u64>,
    pub joined_observations: Counter<u64>,
    pub orphan_observations: Counter<u64>,
    pub merged_batches: Counter<u64>,
    pub receive_errors: Counter<u64>,
    pub skipped_batches: Counter<u64>,
    /// Seconds between a batch being enqueued and leaving the merge.
    pub partition_lag: Histogram<f64>,
    pub join_flush_duration: Histogram<f64>,
    pub checkpoint_persist_duration: Histogram<f64>,
}

impl JoinerMetrics {
    pub fn new() -> Self {
        let meter = global::meter("rewardjoin");
        Self {
            billed_events: meter
                .u64_counter("billed_events")
                .with_description("events reported to the usage backend")
                .init(),
            joined_interactions: meter
                .u64_counter("joined_interactions")
                .with_description("interactions flushed by the join")
                .init(),
            joined_observations: meter
                .u64_counter("joined_observations")
                .with_description("observations attached to an interaction")
                .init(),
            orphan_observations: meter
                .u64_counter("orphan_observations")
                .with_description("observations with no buffered interaction")
                .init(),
            merged_batches: meter
                .u64_counter("merged_batches")
                .with_description("batches emitted by the merge stage")
                .init(),
            receive_errors: meter
                .u64_counter("receive_errors")
                .with_description("transient transport receive failures")
                .init(),
            skipped_batches: meter
                .u64_counter("skipped_batches")
                .with_description("transport events that could not be decoded")
                .init(),
            partition_lag: meter
                .f64_histogram("partition_lag_seconds")
                .with_description("age of batches when the merge emits them")
                .init(),
            join_flush_duration: meter
                .f64_histogram("join_flush_duration_seconds")
                .with_description("time spent flushing closed interactions")
                .init(),
            checkpoint_persist_duration: meter
                .f64_histogram("checkpoint_persist_duration_seconds")
                .with_description("time spent writing a checkpoint blob")
                .init(),
        }
    }
}

impl Default for JoinerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn with_timer_returns_body_value() {
    let metrics = JoinerMetrics::new();
    let labels: [opentelemetry::KeyValue; 0] = [];
    let value = with_timer!(metrics.join_flush_duration, labels, { 1 + 2 });
    assert_eq!(value, 3);
}
