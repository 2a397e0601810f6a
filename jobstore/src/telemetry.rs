// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "document-jobstore";

/// Initialize structured logging with JSON formatting and optional OTLP export
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");
    Ok(tracer)
}

/// Flush remaining spans on graceful shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter and describe the job store metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "jobstore_triggers_acquired_total",
        "Triggers acquired for firing by this node"
    );
    describe_counter!(
        "jobstore_misfires_total",
        "Misfire instructions applied, by instruction"
    );
    describe_histogram!(
        "jobstore_lock_wait_seconds",
        "Time spent waiting to acquire a named lock"
    );
    describe_counter!(
        "jobstore_lock_timeouts_total",
        "Lock acquisitions that gave up"
    );
    describe_counter!(
        "jobstore_recovered_fired_triggers_total",
        "Fired-trigger records reclaimed from failed nodes"
    );
    describe_counter!(
        "jobstore_failed_instances_detected_total",
        "Cluster nodes detected as failed"
    );
    describe_counter!(
        "jobstore_checkin_failures_total",
        "Cluster check-ins that could not be written"
    );

    tracing::info!(
        metrics_port = metrics_port,
        "Prometheus metrics exporter initialized"
    );
    Ok(())
}

#[inline]
pub fn record_triggers_acquired(count: usize) {
    counter!("jobstore_triggers_acquired_total").increment(count as u64);
}

#[inline]
pub fn record_misfire(instruction: &str) {
    counter!("jobstore_misfires_total", "instruction" => instruction.to_string()).increment(1);
}

#[inline]
pub fn record_lock_wait(lock: &str, seconds: f64) {
    histogram!("jobstore_lock_wait_seconds", "lock" => lock.to_string()).record(seconds);
}

#[inline]
pub fn record_lock_timeout(lock: &str) {
    counter!("jobstore_lock_timeouts_total", "lock" => lock.to_string()).increment(1);
}

#[inline]
pub fn record_recovered_fired_trigger() {
    counter!("jobstore_recovered_fired_triggers_total").increment(1);
}

#[inline]
pub fn record_failed_instance() {
    counter!("jobstore_failed_instances_detected_total").increment(1);
}

#[inline]
pub fn record_checkin_failure() {
    counter!("jobstore_checkin_failures_total").increment(1);
}
