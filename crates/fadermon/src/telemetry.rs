//! Logging and OpenTelemetry initialization for fadermon.
//!
//! Always logs to stderr through `tracing-subscriber`. When the `[telemetry]`
//! section names an OTLP endpoint, traces, logs and metrics are exported too.

use std::time::Duration;

use anyhow::{Context, Result};
use faderconf::TelemetryConfig;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::logs::{BatchLogProcessor, SdkLoggerProvider};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{BatchSpanProcessor, RandomIdGenerator, Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "fadermon";

/// Timeout for OTLP exports - prevents blocking on unavailable endpoints
const EXPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize logging from the `[telemetry]` section.
pub fn init(config: &TelemetryConfig) -> Result<()> {
    let otlp = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| OtlpProviders::build(&otlp_url(endpoint)))
        .transpose()?;

    let (trace_layer, log_layer) = match &otlp {
        Some(providers) => (
            Some(tracing_opentelemetry::layer().with_tracer(providers.tracer.tracer(SERVICE_NAME))),
            Some(OpenTelemetryTracingBridge::new(&providers.logger)),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(&config.log_level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(trace_layer)
        .with(log_layer)
        .init();

    if let (Some(providers), Some(endpoint)) = (otlp, &config.otlp_endpoint) {
        global::set_tracer_provider(providers.tracer);
        global::set_meter_provider(providers.meter);
        tracing::info!("OpenTelemetry initialized with OTLP endpoint: {}", endpoint);
    }
    Ok(())
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Normalize `host:port` to a URL the tonic exporters accept.
pub fn otlp_url(endpoint: &str) -> String {
    if endpoint.starts_with("http") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

struct OtlpProviders {
    tracer: SdkTracerProvider,
    logger: SdkLoggerProvider,
    meter: SdkMeterProvider,
}

impl OtlpProviders {
    fn build(endpoint: &str) -> Result<Self> {
        let resource = Resource::builder_empty()
            .with_service_name(SERVICE_NAME)
            .with_attributes(vec![KeyValue::new(
                "service.version",
                env!("CARGO_PKG_VERSION"),
            )])
            .build();

        Ok(Self {
            tracer: tracer_provider(endpoint, resource.clone())?,
            logger: logger_provider(endpoint, resource.clone())?,
            meter: meter_provider(endpoint, resource)?,
        })
    }
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .context("Failed to create OTLP span exporter")?;

    Ok(SdkTracerProvider::builder()
        .with_span_processor(BatchSpanProcessor::builder(exporter).build())
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build())
}

fn logger_provider(endpoint: &str, resource: Resource) -> Result<SdkLoggerProvider> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .context("Failed to create OTLP log exporter")?;

    Ok(SdkLoggerProvider::builder()
        .with_log_processor(BatchLogProcessor::builder(exporter).build())
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .context("Failed to create OTLP metric exporter")?;

    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter).build())
        .with_resource(resource)
        .build())
}
