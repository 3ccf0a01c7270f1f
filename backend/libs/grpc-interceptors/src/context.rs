//! Per-call correlation context
//!
//! The server trace interceptor resolves a trace id and a request id for every
//! call and makes them available to handler code in two ways:
//!
//! - in the request extensions, read through [`RequestContextExt`];
//! - in a task-local scope, read through [`RequestContext::current`], which is
//!   how the client interceptor forwards them on outgoing calls.

use opentelemetry::trace::SpanContext;
use rand::rngs::OsRng;
use rand::RngCore;
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};
use tonic::metadata::MetadataMap;
use tonic::Request;

/// Metadata key carrying the trace id
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Metadata key carrying the request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
}

/// Trace and request identifiers of the call being served
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    /// Valid span context extracted from the incoming `traceparent`
    remote_parent: Option<SpanContext>,
}

impl RequestContext {
    pub fn new(trace_id: Option<String>, request_id: Option<String>) -> Self {
        Self {
            trace_id: trace_id.filter(|id| !id.is_empty()),
            request_id: request_id.filter(|id| !id.is_empty()),
            remote_parent: None,
        }
    }

    pub(crate) fn with_remote_parent(mut self, parent: &SpanContext) -> Self {
        self.remote_parent = parent.is_valid().then(|| parent.clone());
        self
    }

    /// Span context of the upstream caller, kept even when no OpenTelemetry
    /// layer is installed so outgoing calls can continue the trace
    pub fn remote_parent(&self) -> Option<&SpanContext> {
        self.remote_parent.as_ref()
    }

    /// Whether any identifier is known (gates request logging)
    pub fn has_ids(&self) -> bool {
        self.trace_id.is_some() || self.request_id.is_some()
    }

    /// Context of the enclosing [`RequestContext::scope`], if any
    pub fn current() -> Option<RequestContext> {
        REQUEST_CONTEXT.try_with(|ctx| ctx.clone()).ok()
    }

    /// Run `future` with this context as the current one
    pub async fn scope<F: Future>(self, future: F) -> F::Output {
        REQUEST_CONTEXT.scope(self, future).await
    }
}

/// First non-empty ASCII value of `key`
pub(crate) fn header_value(metadata: &MetadataMap, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Generate a 32-character lowercase hex request id
///
/// Uses 16 bytes from the OS random source. If the source fails, the id is
/// derived from the current UNIX time in nanoseconds instead; it is only a
/// correlation token, so uniqueness in practice is enough.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 16];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => hex::encode(bytes),
        Err(e) => {
            tracing::warn!(error = %e, "Random source unavailable, using timestamp request id");
            timestamp_request_id()
        }
    }
}

fn timestamp_request_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{:032x}", nanos)
}

/// Extension trait for reading correlation ids from gRPC requests
///
/// ```rust,no_run
/// use grpc_interceptors::RequestContextExt;
/// use tonic::{Request, Response, Status};
///
/// async fn get_user(request: Request<()>) -> Result<Response<()>, Status> {
///     tracing::info!(request_id = ?request.request_id(), "loading user");
///     Ok(Response::new(()))
/// }
/// ```
pub trait RequestContextExt {
    fn request_context(&self) -> Option<&RequestContext>;

    fn trace_id(&self) -> Option<&str> {
        self.request_context()
            .and_then(|ctx| ctx.trace_id.as_deref())
    }

    fn request_id(&self) -> Option<&str> {
        self.request_context()
            .and_then(|ctx| ctx.request_id.as_deref())
    }
}

impl<T> RequestContextExt for Request<T> {
    fn request_context(&self) -> Option<&RequestContext> {
        self.extensions().get::<RequestContext>()
    }
}
