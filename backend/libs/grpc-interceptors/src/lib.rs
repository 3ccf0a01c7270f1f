//! gRPC Observability Interceptors
//!
//! Cross-cutting instrumentation applied around every gRPC call:
//!
//! - **MetricsInterceptor / GrpcMetricsLayer**: request count and latency by method and code
//! - **TraceInterceptor / TraceLayer**: trace context extraction, server span, correlated logs
//! - **TraceClientInterceptor / TraceClientLayer**: child span and trace context injection
//!   on outgoing calls
//! - **MetadataCarrier**: OpenTelemetry text-map carrier over tonic metadata
//!
//! Every interceptor comes as a handler wrapper (`intercept(method, request, handler)`)
//! and as a tower layer. Handler results are always returned unchanged.
//!
//! ## Correlation
//!
//! Calls are correlated by two metadata keys, `x-trace-id` and `x-request-id`,
//! next to the W3C `traceparent`/`tracestate` headers written by the global
//! propagator. Missing request ids are generated (32 hex chars). Handlers read
//! them with [`RequestContextExt`]; outgoing calls made while serving a request
//! forward them automatically.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use grpc_interceptors::{register_metrics, GrpcMetricsLayer, TraceLayer};
//!
//! register_metrics(prometheus::default_registry())?;
//!
//! Server::builder()
//!     .layer(GrpcMetricsLayer::new())
//!     .layer(TraceLayer::new())
//!     .add_service(my_service)
//!     .serve(addr)
//!     .await?;
//! ```

mod carrier;
mod client;
mod context;
mod metrics;
mod metrics_interceptor;
mod server;
pub mod status;

pub use carrier::{extract_context, inject_context, MetadataCarrier};
pub use client::{TraceClientInterceptor, TraceClientLayer, TraceClientService};
pub use context::{
    generate_request_id, RequestContext, RequestContextExt, REQUEST_ID_HEADER, TRACE_ID_HEADER,
};
pub use metrics::{GrpcMetrics, GRPC_METRICS};
pub use metrics_interceptor::{
    GrpcMetricsLayer, GrpcMetricsService, MetricsFuture, MetricsInterceptor,
};
pub use server::{TraceInterceptor, TraceLayer, TraceService};

// Re-export tonic Status for convenience
pub use tonic::Status;

/// Register the process-wide gRPC metrics with a Prometheus registry
///
/// Call this once during server initialization
pub fn register_metrics(registry: &prometheus::Registry) -> prometheus::Result<()> {
    GRPC_METRICS.register(registry)
}
