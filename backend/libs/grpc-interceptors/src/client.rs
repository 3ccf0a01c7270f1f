//! Client-side trace interceptor
//!
//! Starts a `grpc.client` span as a child of the current span, injects its
//! trace context into the outgoing metadata and forwards the correlation ids
//! of the call being served (see [`RequestContext::current`]).

use crate::carrier::{inject_context, MetadataCarrier};
use crate::context::{RequestContext, REQUEST_ID_HEADER, TRACE_ID_HEADER};
use crate::status::{code_name, code_of, status_from_headers};
use futures::future::BoxFuture;
use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context as OtelContext;
use std::fmt;
use std::future::Future;
use std::task::{Context, Poll};
use tonic::metadata::MetadataMap;
use tonic::service::Interceptor;
use tonic::{Code, Request, Status};
use tower::{Layer, Service};
use tracing::{field, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Write trace context and correlation ids into outgoing metadata
///
/// When `cx` carries no valid span (no OpenTelemetry layer installed), the
/// remote parent of the call being served is propagated instead.
fn propagate(cx: &OtelContext, metadata: &mut MetadataMap) {
    let current = RequestContext::current();

    if cx.span().span_context().is_valid() {
        inject_context(cx, metadata);
    } else if let Some(parent) = current.as_ref().and_then(RequestContext::remote_parent) {
        inject_context(&OtelContext::new().with_remote_span_context(parent.clone()), metadata);
    }

    let Some(ctx) = current else {
        return;
    };
    let mut carrier = MetadataCarrier::new(metadata);
    for (key, value) in [(TRACE_ID_HEADER, ctx.trace_id), (REQUEST_ID_HEADER, ctx.request_id)] {
        if let Some(value) = value {
            if carrier.get(key).is_none() {
                carrier.set(key, value);
            }
        }
    }
}

/// One traced outgoing call
struct ClientCall {
    span: Span,
}

impl ClientCall {
    fn start(method: &str) -> Self {
        let span = tracing::info_span!(
            "grpc.client",
            otel.name = %method,
            otel.kind = "client",
            otel.status_code = field::Empty,
            otel.status_message = field::Empty,
            rpc.system = "grpc",
            rpc.method = %method,
            rpc.status_code = field::Empty,
        );
        Self { span }
    }

    fn inject(&self, metadata: &mut MetadataMap) {
        propagate(&self.span.context(), metadata);
    }

    fn finish(&self, code: Code, error: Option<&dyn fmt::Display>) {
        self.span.record("rpc.status_code", code_name(code));

        if let Some(error) = error {
            self.span.record("otel.status_code", "ERROR");
            self.span.record("otel.status_message", field::display(error));
            tracing::warn!(
                parent: &self.span,
                code = code_name(code),
                error = %error,
                "gRPC call failed"
            );
        }
    }
}

/// Outgoing-call wrapper creating a child span and propagating trace context
///
/// As a tonic [`Interceptor`] it only injects the current span context and
/// correlation ids; [`TraceClientInterceptor::intercept`] and
/// [`TraceClientLayer`] additionally record the call outcome on a child span.
///
/// ```rust,ignore
/// let interceptor = TraceClientInterceptor::new();
/// let response = interceptor
///     .intercept("/user.UserService/GetUser", Request::new(req), |req| client.get_user(req))
///     .await?;
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceClientInterceptor;

impl TraceClientInterceptor {
    pub fn new() -> Self {
        Self
    }

    pub async fn intercept<Req, T, F, Fut>(
        &self,
        method: &str,
        mut request: Request<Req>,
        invoker: F,
    ) -> Result<T, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let call = ClientCall::start(method);
        call.inject(request.metadata_mut());

        let span = call.span.clone();
        async move {
            let result = invoker(request).await;
            call.finish(
                code_of(&result),
                result.as_ref().err().map(|status| status as &dyn fmt::Display),
            );
            result
        }
        .instrument(span)
        .await
    }
}

impl Interceptor for TraceClientInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        propagate(&Span::current().context(), request.metadata_mut());
        Ok(request)
    }
}

/// Tower layer tracing calls made through a tonic `Channel`
///
/// ```rust,ignore
/// let channel = Channel::from_static("http://[::1]:50051").connect().await?;
/// let channel = tower::ServiceBuilder::new()
///     .layer(TraceClientLayer::new())
///     .service(channel);
/// let mut client = UserServiceClient::new(channel);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceClientLayer;

impl TraceClientLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for TraceClientLayer {
    type Service = TraceClientService<S>;

    fn layer(&self, service: S) -> Self::Service {
        TraceClientService { inner: service }
    }
}

#[derive(Debug, Clone)]
pub struct TraceClientService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for TraceClientService<S>
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
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let call = ClientCall::start(req.uri().path());
        let mut metadata = MetadataMap::from_headers(std::mem::take(req.headers_mut()));
        call.inject(&mut metadata);
        *req.headers_mut() = metadata.into_headers();

        let span = call.span.clone();
        Box::pin(
            async move {
                let result = inner.call(req).await;
                match &result {
                    Ok(response) => match status_from_headers(response.headers()) {
                        Some(status) => call.finish(status.code(), Some(&status)),
                        None => call.finish(Code::Ok, None),
                    },
                    Err(error) => call.finish(Code::Unknown, Some(error)),
                }
                result
            }
            .instrument(span),
        )
    }
}
