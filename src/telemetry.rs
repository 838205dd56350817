//! Telemetry and structured logging for the conversion service.

use crate::format::IconFormat;
use crate::job::JobId;
use opentelemetry::trace::{Span, TraceError, Tracer};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace, Resource};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

pub const TRACER_NAME: &str = "icon-convert-worker";

/// Conversions slower than this are logged as warnings.
const SLOW_CONVERSION_MS: u64 = 5000;

/// Final outcome of one conversion request, as reported to metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionOutcome {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    Rejected,
    QueueFull,
}

impl fmt::Display for ConversionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionOutcome::Completed => write!(f, "completed"),
            ConversionOutcome::Failed => write!(f, "failed"),
            ConversionOutcome::TimedOut => write!(f, "timed_out"),
            ConversionOutcome::Cancelled => write!(f, "cancelled"),
            ConversionOutcome::Rejected => write!(f, "rejected"),
            ConversionOutcome::QueueFull => write!(f, "queue_full"),
        }
    }
}

/// One conversion request as seen by the metrics side-channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionEvent {
    /// Absent when the request was rejected before a job was created.
    pub job_id: Option<JobId>,
    pub input_format: IconFormat,
    pub output_format: IconFormat,
    pub input_size: usize,
    pub output_size: Option<usize>,
    pub duration_ms: u64,
    pub outcome: ConversionOutcome,
}

/// Receives one event per conversion request.
///
/// Aggregation lives elsewhere; implementations must be cheap and must not
/// block the caller.
pub trait MetricsCollector: Send + Sync {
    fn record(&self, event: &ConversionEvent);
}

/// Collector that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollector;

impl MetricsCollector for NoopCollector {
    fn record(&self, _event: &ConversionEvent) {}
}

/// Collector that emits structured logs and OpenTelemetry spans.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryCollector;

impl MetricsCollector for TelemetryCollector {
    fn record(&self, event: &ConversionEvent) {
        record_conversion_telemetry(event);
    }
}

/// Records telemetry for a finished conversion request.
///
/// Emits a span carrying the event attributes plus a structured log line,
/// and warns when the request exceeded the slow-conversion threshold.
pub fn record_conversion_telemetry(event: &ConversionEvent) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("icon_conversion");

    if let Some(job_id) = event.job_id {
        span.set_attribute(KeyValue::new("job_id", job_id.to_string()));
    }
    span.set_attribute(KeyValue::new("input_format", event.input_format.to_string()));
    span.set_attribute(KeyValue::new("output_format", event.output_format.to_string()));
    span.set_attribute(KeyValue::new("input_size", event.input_size as i64));
    if let Some(output_size) = event.output_size {
        span.set_attribute(KeyValue::new("output_size", output_size as i64));
    }
    span.set_attribute(KeyValue::new("duration_ms", event.duration_ms as i64));
    span.set_attribute(KeyValue::new("outcome", event.outcome.to_string()));

    match event.outcome {
        ConversionOutcome::Completed => info!(
            job_id = ?event.job_id,
            input_format = %event.input_format,
            output_format = %event.output_format,
            input_size = event.input_size,
            output_size = ?event.output_size,
            duration_ms = event.duration_ms,
            "Icon conversion completed"
        ),
        outcome => warn!(
            job_id = ?event.job_id,
            input_format = %event.input_format,
            output_format = %event.output_format,
            input_size = event.input_size,
            duration_ms = event.duration_ms,
            outcome = %outcome,
            "Icon conversion did not complete"
        ),
    }

    if event.duration_ms > SLOW_CONVERSION_MS {
        warn!(
            job_id = ?event.job_id,
            duration_ms = event.duration_ms,
            "Icon conversion exceeded performance threshold ({}ms)",
            SLOW_CONVERSION_MS
        );
    }

    span.end();
}

/// Records a worker heartbeat for monitoring pool health.
///
/// # Arguments
///
/// * `queue_length` - Current number of pending jobs
/// * `busy_workers` - Workers currently running a job
pub fn record_worker_heartbeat(queue_length: usize, busy_workers: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("queue_length", queue_length as i64));
    span.set_attribute(KeyValue::new("busy_workers", busy_workers as i64));
    span.end();

    info!(queue_length, busy_workers, "Worker heartbeat");
}

/// Exports conversion and heartbeat spans to an OTLP collector.
///
/// Installs a batching tonic exporter as the global tracer provider, tagged
/// with `service_name` and the crate version. Spans recorded before this
/// call, or when it fails, go to the no-op provider.
pub fn init_telemetry(endpoint: &str, service_name: &str) -> Result<(), TraceError> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);
    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(trace::config().with_resource(resource))
        .install_batch(runtime::Tokio)?;
    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!(endpoint, service_name, "OTLP span export enabled");
    Ok(())
}

/// Flushes pending spans. Call once before the process exits.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(outcome: ConversionOutcome, duration_ms: u64) -> ConversionEvent {
        ConversionEvent {
            job_id: Some(JobId::new()),
            input_format: IconFormat::Svg,
            output_format: IconFormat::Ico,
            input_size: 512,
            output_size: (outcome == ConversionOutcome::Completed).then_some(2048),
            duration_ms,
            outcome,
        }
    }

    #[test]
    fn test_record_completed_conversion() {
        // No provider installed: spans go to the no-op tracer.
        TelemetryCollector.record(&event(ConversionOutcome::Completed, 12));
    }

    #[test]
    fn test_record_failed_and_slow_conversion() {
        TelemetryCollector.record(&event(ConversionOutcome::Failed, 6000));
        record_worker_heartbeat(3, 2);
    }

    #[test]
    fn test_event_serializes() {
        let mut ev = event(ConversionOutcome::QueueFull, 0);
        ev.job_id = None;
        let json = serde_json::to_value(&ev).unwrap();

        assert_eq!(json["outcome"], "queue_full");
        assert_eq!(json["input_format"], "svg");
        assert!(json["job_id"].is_null());
    }
}
