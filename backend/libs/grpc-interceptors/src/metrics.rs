//! Prometheus metrics definitions for gRPC servers
//!
//! Request count and latency are labeled by full method path and status code name.

use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounterVec, IntGaugeVec, Registry, Result,
};
use std::time::Duration;

lazy_static! {
    /// Process-wide gRPC metrics instance used by default interceptors
    pub static ref GRPC_METRICS: GrpcMetrics = GrpcMetrics::new();
}

/// gRPC server metrics
#[derive(Clone)]
pub struct GrpcMetrics {
    /// Total gRPC requests
    /// Labels: method, code
    pub requests_total: IntCounterVec,

    /// gRPC request latency in seconds
    /// Labels: method, code
    pub request_duration_seconds: HistogramVec,

    /// Current in-flight gRPC requests
    /// Labels: method
    pub in_flight_requests: IntGaugeVec,
}

impl GrpcMetrics {
    /// Create an unregistered set of collectors
    pub fn new() -> Self {
        let requests_total = IntCounterVec::new(
            opts!("grpc_server_requests_total", "Total gRPC server requests"),
            &["method", "code"],
        )
        .expect("static metric options are valid");

        let request_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "grpc_server_request_duration_seconds",
                "gRPC server request latency in seconds",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["method", "code"],
        )
        .expect("static metric options are valid");

        let in_flight_requests = IntGaugeVec::new(
            opts!(
                "grpc_server_in_flight_requests",
                "Current in-flight gRPC server requests"
            ),
            &["method"],
        )
        .expect("static metric options are valid");

        Self {
            requests_total,
            request_duration_seconds,
            in_flight_requests,
        }
    }

    /// Register the collectors with a Prometheus registry
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.requests_total.clone()))?;
        registry.register(Box::new(self.request_duration_seconds.clone()))?;
        registry.register(Box::new(self.in_flight_requests.clone()))?;

        Ok(())
    }

    /// Record one completed request
    pub fn record_request(&self, method: &str, code: &str, elapsed: Duration) {
        self.requests_total
            .with_label_values(&[method, code])
            .inc();

        self.request_duration_seconds
            .with_label_values(&[method, code])
            .observe(elapsed.as_secs_f64());
    }

    pub fn inc_in_flight(&self, method: &str) {
        self.in_flight_requests.with_label_values(&[method]).inc();
    }

    pub fn dec_in_flight(&self, method: &str) {
        self.in_flight_requests.with_label_values(&[method]).dec();
    }
}

impl Default for GrpcMetrics {
    fn default() -> Self {
        Self::new()
    }
}
