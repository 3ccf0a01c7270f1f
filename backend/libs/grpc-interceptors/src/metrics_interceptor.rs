//! Server-side metrics interceptor
//!
//! Times every call and records one counter increment and one latency
//! observation labeled by method and status code. Available as a handler
//! wrapper ([`MetricsInterceptor`]) and as a tower layer ([`GrpcMetricsLayer`]).

use crate::metrics::{GrpcMetrics, GRPC_METRICS};
use crate::status::{code_name, code_of, status_from_headers};
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Instant;
use tonic::{Code, Request, Status};
use tower::{Layer, Service};

/// RAII guard for tracking in-flight requests
///
/// Increments the in-flight gauge when created and decrements it when dropped,
/// so cancelled calls are accounted for as well.
struct InFlightGuard {
    metrics: GrpcMetrics,
    method: String,
}

impl InFlightGuard {
    fn new(metrics: &GrpcMetrics, method: &str) -> Self {
        metrics.inc_in_flight(method);
        Self {
            metrics: metrics.clone(),
            method: method.to_string(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.dec_in_flight(&self.method);
    }
}

/// Handler wrapper recording request count and latency
///
/// ## Usage
///
/// ```rust,no_run
/// use grpc_interceptors::MetricsInterceptor;
/// use tonic::{Request, Response, Status};
///
/// async fn get_user(request: Request<String>) -> Result<Response<String>, Status> {
///     Ok(Response::new(request.into_inner()))
/// }
///
/// # async fn example() -> Result<(), Status> {
/// let interceptor = MetricsInterceptor::new();
/// let request = Request::new("user-1".to_string());
/// let response = interceptor
///     .intercept("/user.UserService/GetUser", request, get_user)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MetricsInterceptor {
    metrics: GrpcMetrics,
}

impl MetricsInterceptor {
    /// Interceptor recording into the process-wide [`GRPC_METRICS`]
    pub fn new() -> Self {
        Self::with_metrics(GRPC_METRICS.clone())
    }

    pub fn with_metrics(metrics: GrpcMetrics) -> Self {
        Self { metrics }
    }

    /// Invoke `handler` and record its outcome
    ///
    /// The handler's result is returned unchanged.
    pub async fn intercept<Req, T, F, Fut>(
        &self,
        method: &str,
        request: Request<Req>,
        handler: F,
    ) -> Result<T, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let _in_flight = InFlightGuard::new(&self.metrics, method);
        let start = Instant::now();

        let result = handler(request).await;

        self.metrics
            .record_request(method, code_name(code_of(&result)), start.elapsed());

        result
    }
}

impl Default for MetricsInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Tower layer applying [`MetricsInterceptor`] semantics to a tonic server
///
/// ```rust,ignore
/// use grpc_interceptors::GrpcMetricsLayer;
///
/// Server::builder()
///     .layer(GrpcMetricsLayer::new())
///     .add_service(my_service)
///     .serve(addr)
///     .await?;
/// ```
#[derive(Clone)]
pub struct GrpcMetricsLayer {
    metrics: GrpcMetrics,
}

impl GrpcMetricsLayer {
    pub fn new() -> Self {
        Self::with_metrics(GRPC_METRICS.clone())
    }

    pub fn with_metrics(metrics: GrpcMetrics) -> Self {
        Self { metrics }
    }
}

impl Default for GrpcMetricsLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for GrpcMetricsLayer {
    type Service = GrpcMetricsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        GrpcMetricsService {
            inner: service,
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GrpcMetricsService<S> {
    inner: S,
    metrics: GrpcMetrics,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for GrpcMetricsService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = MetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let method = req.uri().path().to_string();
        let in_flight = InFlightGuard::new(&self.metrics, &method);

        MetricsFuture {
            inner: self.inner.call(req),
            metrics: self.metrics.clone(),
            method,
            start: Instant::now(),
            _in_flight: in_flight,
        }
    }
}

/// Response future of [`GrpcMetricsService`]
#[pin_project]
pub struct MetricsFuture<F> {
    #[pin]
    inner: F,
    metrics: GrpcMetrics,
    method: String,
    start: Instant,
    _in_flight: InFlightGuard,
}

impl<F, ResBody, E> Future for MetricsFuture<F>
where
    F: Future<Output = Result<http::Response<ResBody>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));

        let code = match &result {
            Ok(response) => status_from_headers(response.headers())
                .map(|status| status.code())
                .unwrap_or(Code::Ok),
            Err(_) => Code::Unknown,
        };
        this.metrics
            .record_request(this.method, code_name(code), this.start.elapsed());

        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(metrics: &GrpcMetrics, method: &str, code: &str) -> u64 {
        metrics.requests_total.with_label_values(&[method, code]).get()
    }

    #[tokio::test]
    async fn test_intercept_records_success() {
        let metrics = GrpcMetrics::new();
        let interceptor = MetricsInterceptor::with_metrics(metrics.clone());

        let result = interceptor
            .intercept("/test.Service/TestMethod", Request::new(()), |_req| async {
                Ok::<_, Status>("response")
            })
            .await;

        assert_eq!(result.unwrap(), "response");
        assert_eq!(count(&metrics, "/test.Service/TestMethod", "OK"), 1);
        assert_eq!(
            metrics
                .request_duration_seconds
                .with_label_values(&["/test.Service/TestMethod", "OK"])
                .get_sample_count(),
            1
        );
    }

    #[tokio::test]
    async fn test_intercept_records_error_code() {
        let metrics = GrpcMetrics::new();
        let interceptor = MetricsInterceptor::with_metrics(metrics.clone());

        let result: Result<(), Status> = interceptor
            .intercept("/test.Service/TestMethod", Request::new(()), |_req| async {
                Err(Status::deadline_exceeded("too slow"))
            })
            .await;

        let status = result.unwrap_err();
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert_eq!(status.message(), "too slow");
        assert_eq!(count(&metrics, "/test.Service/TestMethod", "DeadlineExceeded"), 1);
        assert_eq!(count(&metrics, "/test.Service/TestMethod", "OK"), 0);
    }

    #[tokio::test]
    async fn test_in_flight_released_after_call() {
        let metrics = GrpcMetrics::new();
        let interceptor = MetricsInterceptor::with_metrics(metrics.clone());
        let gauge = metrics
            .in_flight_requests
            .with_label_values(&["/test.Service/TestMethod"]);

        let observed = interceptor
            .intercept("/test.Service/TestMethod", Request::new(()), |_req| {
                let gauge = gauge.clone();
                async move { Ok::<_, Status>(gauge.get()) }
            })
            .await
            .unwrap();

        assert_eq!(observed, 1);
        assert_eq!(gauge.get(), 0);
    }
}
