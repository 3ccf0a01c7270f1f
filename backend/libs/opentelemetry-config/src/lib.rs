//! OpenTelemetry Configuration Library
//!
//! Sets up structured logging and distributed tracing for services using the
//! gRPC interceptors:
//!
//! - `tracing-subscriber` registry with an `EnvFilter` and a text or JSON `fmt` layer
//! - optional OTLP span export through `tracing-opentelemetry`
//! - W3C trace context propagator, installed even when export is disabled so
//!   incoming `traceparent` headers are still honored

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    runtime,
    trace::{RandomIdGenerator, Sampler, Tracer},
    Resource,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;

pub use config::{ExporterType, LogFormat, TracingConfig};

/// Errors raised while installing the telemetry pipeline
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to install OTLP tracer: {0}")]
    Exporter(#[from] opentelemetry::trace::TraceError),

    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Flushes and shuts down span export when dropped
///
/// Keep it alive for the lifetime of the service.
#[must_use = "dropping the guard shuts down span export"]
pub struct TelemetryGuard {
    exporting: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.exporting {
            global::shutdown_tracer_provider();
        }
    }
}

/// Initialize logging and tracing for a service
///
/// Span export requires a running tokio runtime (batch exporter).
///
/// # Example
/// ```no_run
/// use opentelemetry_config::{init_tracing, TracingConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let _telemetry = init_tracing("user-service", TracingConfig::from_env())
///         .expect("Failed to initialize tracing");
/// }
/// ```
pub fn init_tracing(
    service_name: &str,
    config: TracingConfig,
) -> Result<TelemetryGuard, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let tracer = if config.enabled {
        Some(init_otlp_tracer(service_name, &config)?)
    } else {
        None
    };
    let exporting = tracer.is_some();
    let telemetry_layer =
        tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)?,
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(telemetry_layer);

    match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_level(true))
            .try_init()?,
    }

    tracing::info!(
        service = service_name,
        exporter = ?config.exporter,
        export_enabled = exporting,
        sample_rate = config.sample_rate,
        "Telemetry initialized"
    );

    Ok(TelemetryGuard { exporting })
}

fn service_resource(service_name: &str, config: &TracingConfig) -> Resource {
    Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", config.service_version.clone()),
        KeyValue::new("deployment.environment", config.environment.clone()),
    ])
}

/// Parent-based ratio sampler; upstream sampling decisions win
fn sampler(config: &TracingConfig) -> Sampler {
    Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(config.sample_ratio())))
}

/// Initialize the OTLP exporter (Jaeger, Tempo and other OTLP backends)
fn init_otlp_tracer(service_name: &str, config: &TracingConfig) -> Result<Tracer, TelemetryError> {
    let endpoint = config
        .otlp_endpoint
        .clone()
        .unwrap_or_else(|| "http://jaeger:4317".to_string());

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            opentelemetry_sdk::trace::config()
                .with_sampler(sampler(config))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(service_resource(service_name, config)),
        )
        .install_batch(runtime::Tokio)?;

    Ok(tracer)
}
