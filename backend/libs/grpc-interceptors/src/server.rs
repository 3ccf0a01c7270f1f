//! Server-side trace/log interceptor
//!
//! For every call this interceptor:
//! 1. Extracts the remote trace context from the request metadata
//! 2. Starts a `grpc.server` span parented on it
//! 3. Resolves the trace id (`x-trace-id`, else the span's trace id) and the
//!    request id (`x-request-id`, else a generated one)
//! 4. Stores both in the request extensions and the task-local [`RequestContext`],
//!    and records them on the span so handler log lines carry them
//! 5. Logs start and completion/failure, and records `rpc.status_code` on the span
//!
//! Handler results are passed through untouched.

use crate::carrier::extract_context;
use crate::context::{
    generate_request_id, header_value, RequestContext, REQUEST_ID_HEADER, TRACE_ID_HEADER,
};
use crate::status::{code_name, code_of, status_from_headers};
use futures::future::BoxFuture;
use opentelemetry::trace::TraceContextExt;
use std::fmt;
use std::future::Future;
use std::task::{Context, Poll};
use tonic::metadata::MetadataMap;
use tonic::{Code, Request, Status};
use tower::{Layer, Service};
use tracing::{field, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Trace id of the span's OpenTelemetry context, if valid
pub(crate) fn span_trace_id(span: &Span) -> Option<String> {
    let cx = span.context();
    let otel_span = cx.span();
    let span_context = otel_span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

/// Span id of the span's OpenTelemetry context (empty when invalid)
pub(crate) fn span_id(span: &Span) -> String {
    let cx = span.context();
    let otel_span = cx.span();
    let span_context = otel_span.span_context();
    if span_context.is_valid() {
        span_context.span_id().to_string()
    } else {
        String::new()
    }
}

/// One traced server call
struct ServerCall {
    method: String,
    span: Span,
    context: RequestContext,
}

impl ServerCall {
    fn start(method: &str, metadata: &MetadataMap) -> Self {
        let span = tracing::info_span!(
            "grpc.server",
            otel.name = %method,
            otel.kind = "server",
            rpc.system = "grpc",
            rpc.method = %method,
            rpc.status_code = field::Empty,
            trace_id = field::Empty,
            request_id = field::Empty,
        );
        let parent = extract_context(metadata);
        let remote = parent.span().span_context().clone();
        span.set_parent(parent);

        // Without an OpenTelemetry layer the span has no context; use the remote one
        let trace_id = header_value(metadata, TRACE_ID_HEADER)
            .or_else(|| span_trace_id(&span))
            .or_else(|| remote.is_valid().then(|| remote.trace_id().to_string()));
        let request_id =
            header_value(metadata, REQUEST_ID_HEADER).unwrap_or_else(generate_request_id);
        let context = RequestContext::new(trace_id, Some(request_id)).with_remote_parent(&remote);

        if let Some(trace_id) = &context.trace_id {
            span.record("trace_id", trace_id.as_str());
        }
        if let Some(request_id) = &context.request_id {
            span.record("request_id", request_id.as_str());
        }

        Self {
            method: method.to_string(),
            span,
            context,
        }
    }

    fn log_started(&self) {
        if self.context.has_ids() {
            tracing::info!(
                method = %self.method,
                trace_id = self.context.trace_id.as_deref().unwrap_or_default(),
                span_id = %span_id(&self.span),
                "gRPC request started"
            );
        }
    }

    fn finish(&self, code: Code, error: Option<&dyn fmt::Display>) {
        self.span.record("rpc.status_code", code_name(code));

        if !self.context.has_ids() {
            return;
        }
        match error {
            Some(error) => tracing::error!(
                method = %self.method,
                code = code_name(code),
                error = %error,
                "gRPC request failed"
            ),
            None => tracing::info!(method = %self.method, "gRPC request completed"),
        }
    }
}

/// Handler wrapper adding trace propagation and correlated logging
///
/// ## Usage
///
/// ```rust,no_run
/// use grpc_interceptors::{RequestContextExt, TraceInterceptor};
/// use tonic::{Request, Response, Status};
///
/// async fn get_user(request: Request<String>) -> Result<Response<String>, Status> {
///     // Correlation ids resolved by the interceptor
///     tracing::info!(request_id = ?request.request_id(), "loading user");
///     Ok(Response::new(request.into_inner()))
/// }
///
/// # async fn example(request: Request<String>) -> Result<(), Status> {
/// let response = TraceInterceptor::new()
///     .intercept("/user.UserService/GetUser", request, get_user)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceInterceptor;

impl TraceInterceptor {
    pub fn new() -> Self {
        Self
    }

    pub async fn intercept<Req, T, F, Fut>(
        &self,
        method: &str,
        mut request: Request<Req>,
        handler: F,
    ) -> Result<T, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let call = ServerCall::start(method, request.metadata());
        request.extensions_mut().insert(call.context.clone());

        let span = call.span.clone();
        let context = call.context.clone();
        let handle = async move {
            call.log_started();
            let result = handler(request).await;
            call.finish(
                code_of(&result),
                result.as_ref().err().map(|status| status as &dyn fmt::Display),
            );
            result
        };

        context.scope(handle.instrument(span)).await
    }
}

/// Tower layer applying [`TraceInterceptor`] semantics to a tonic server
///
/// The method is the request path (`/package.Service/Method`); the status is
/// read from the `grpc-status` response header.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceLayer;

impl TraceLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for TraceLayer {
    type Service = TraceService<S>;

    fn layer(&self, service: S) -> Self::Service {
        TraceService { inner: service }
    }
}

#[derive(Debug, Clone)]
pub struct TraceService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for TraceService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display,
    ReqBody: Send + 'static,
    ResBody: 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; keep the one that was polled
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let method = req.uri().path().to_string();
        let metadata = MetadataMap::from_headers(std::mem::take(req.headers_mut()));
        let call = ServerCall::start(&method, &metadata);
        *req.headers_mut() = metadata.into_headers();
        req.extensions_mut().insert(call.context.clone());

        let span = call.span.clone();
        let context = call.context.clone();
        let handle = async move {
            call.log_started();
            let result = inner.call(req).await;
            match &result {
                Ok(response) => match status_from_headers(response.headers()) {
                    Some(status) => call.finish(status.code(), Some(&status)),
                    None => call.finish(Code::Ok, None),
                },
                Err(error) => call.finish(Code::Unknown, Some(error)),
            }
            result
        };

        Box::pin(context.scope(handle.instrument(span)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_invocation() {
        let mut called = false;
        let result = TraceInterceptor::new()
            .intercept("/test.Service/TestMethod", Request::new(()), |_req| {
                called = true;
                async { Ok::<_, Status>("response") }
            })
            .await;

        assert_eq!(result.unwrap(), "response");
        assert!(called);
    }

    #[tokio::test]
    async fn test_handler_error_passes_through() {
        let result: Result<(), Status> = TraceInterceptor::new()
            .intercept("/test.Service/TestMethod", Request::new(()), |_req| async {
                Err(Status::deadline_exceeded("deadline"))
            })
            .await;

        let status = result.unwrap_err();
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert_eq!(status.message(), "deadline");
    }

    #[tokio::test]
    async fn test_header_ids_are_used() {
        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert(TRACE_ID_HEADER, "trace-from-header".parse().unwrap());
        request
            .metadata_mut()
            .insert(REQUEST_ID_HEADER, "request-from-header".parse().unwrap());

        let (from_extensions, from_scope) = TraceInterceptor::new()
            .intercept("/test.Service/TestMethod", request, |req| async move {
                let ctx = req.extensions().get::<RequestContext>().cloned();
                Ok::<_, Status>((ctx, RequestContext::current()))
            })
            .await
            .unwrap();

        let expected = RequestContext::new(
            Some("trace-from-header".to_string()),
            Some("request-from-header".to_string()),
        );
        assert_eq!(from_extensions, Some(expected.clone()));
        assert_eq!(from_scope, Some(expected));
    }

    #[tokio::test]
    async fn test_request_id_generated_when_missing() {
        let ctx = TraceInterceptor::new()
            .intercept("/test.Service/TestMethod", Request::new(()), |req| async move {
                Ok::<_, Status>(req.extensions().get::<RequestContext>().cloned())
            })
            .await
            .unwrap()
            .expect("context stored in extensions");

        // No tracer installed, so no trace id can be derived
        assert_eq!(ctx.trace_id, None);
        assert_eq!(ctx.request_id.map(|id| id.len()), Some(32));
    }

    #[test]
    fn test_span_ids_without_tracer() {
        let span = tracing::info_span!("detached");
        assert_eq!(span_trace_id(&span), None);
        assert_eq!(span_id(&span), "");
    }
}
