use crate::Environment;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
    propagation::TraceContextPropagator,
    trace::{Sampler, SdkTracerProvider},
};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const METRIC_EXPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Owns the OTLP tracer and meter providers for the lifetime of a process and
/// flushes them when dropped.
///
/// The OTLP exporters are tonic based, so `init` has to be called from inside
/// a Tokio runtime that outlives the guard.
///
/// ```ignore
/// let rt = tokio::runtime::Runtime::new()?;
/// let _telemetry = rt.block_on(async {
///     TelemetryGuard::init("detector", "http://localhost:4317", Environment::Production)
/// })?;
/// ```
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl TelemetryGuard {
    /// Register OTLP trace and metric exporters and install the tracing
    /// subscriber (pretty in development, JSON in production) bridged to
    /// OpenTelemetry.
    pub fn init(
        service_name: &str,
        endpoint: &str,
        environment: Environment,
    ) -> anyhow::Result<Self> {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let resource = Resource::builder()
            .with_attributes([
                KeyValue::new(
                    opentelemetry_semantic_conventions::attribute::SERVICE_NAME,
                    service_name.to_string(),
                ),
                KeyValue::new(
                    opentelemetry_semantic_conventions::attribute::SERVICE_VERSION,
                    env!("CARGO_PKG_VERSION"),
                ),
                KeyValue::new("deployment.environment", environment.as_str()),
            ])
            .build();

        let span_exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?;

        let tracer_provider = SdkTracerProvider::builder()
            .with_resource(resource.clone())
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
            .with_batch_exporter(span_exporter)
            .build();

        global::set_tracer_provider(tracer_provider.clone());

        let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?;

        let reader = PeriodicReader::builder(metric_exporter)
            .with_interval(METRIC_EXPORT_INTERVAL)
            .build();

        let meter_provider = SdkMeterProvider::builder()
            .with_resource(resource)
            .with_reader(reader)
            .build();

        global::set_meter_provider(meter_provider.clone());

        let otel_layer =
            tracing_opentelemetry::layer().with_tracer(global::tracer(service_name.to_string()));

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let registry = tracing_subscriber::registry()
            .with(env_filter)
            .with(otel_layer);

        match environment {
            Environment::Production => {
                registry
                    .with(tracing_subscriber::fmt::layer().json().with_level(true))
                    .try_init()?;
            }
            Environment::Development => {
                registry
                    .with(tracing_subscriber::fmt::layer().pretty().with_ansi(true))
                    .try_init()?;
            }
        }

        tracing::info!(service_name, endpoint, "OpenTelemetry export enabled");

        Ok(Self {
            tracer_provider,
            meter_provider,
        })
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.tracer_provider.shutdown() {
            eprintln!("Failed to shutdown tracer provider: {:?}", e);
        }
        if let Err(e) = self.meter_provider.shutdown() {
            eprintln!("Failed to shutdown meter provider: {:?}", e);
        }
    }
}

/// Creates an info-level span and enters it.
#[macro_export]
macro_rules! span {
    ($name:literal) => {
        tracing::info_span!($name).entered()
    };
}

/// Creates a debug-level span and enters it.
#[macro_export]
macro_rules! span_debug {
    ($name:literal) => {
        tracing::debug_span!($name).entered()
    };
}
