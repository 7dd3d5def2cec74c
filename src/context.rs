//! Per-request context and structured log fields.

use crate::principal::{Device, UserId};
use tracing::Span;

/// Context of one authenticated request.
///
/// Lives for a single request and is never shared across requests. The
/// [`span`](RequestContext::span) method opens a tracing span carrying
/// the standard label set (`user_id`, `device_id`, `request_method`,
/// `request_path`, `trace_id`) so every event logged inside it is
/// attributable.
#[derive(Clone, Debug)]
pub struct RequestContext {
    user: UserId,
    device: Device,
    request_method: String,
    request_path: String,
    trace_id: Option<String>,
}

impl RequestContext {
    /// Creates a request context for an authenticated user.
    pub fn new(
        user: UserId,
        device: Device,
        request_method: impl Into<String>,
        request_path: impl Into<String>,
        trace_id: Option<String>,
    ) -> Self {
        Self {
            user,
            device,
            request_method: request_method.into(),
            request_path: request_path.into(),
            trace_id,
        }
    }

    /// The authenticated user.
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// The device the request originated from.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The HTTP method of the request.
    pub fn request_method(&self) -> &str {
        &self.request_method
    }

    /// The request path.
    pub fn request_path(&self) -> &str {
        &self.request_path
    }

    /// The trace id propagated by the load balancer, if any.
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Opens a span carrying the request's structured labels.
    pub fn span(&self, event: &str) -> Span {
        tracing::info_span!(
            "request",
            event,
            user_id = %self.user,
            device_id = self.device.device_id.as_deref().unwrap_or("-"),
            request_method = %self.request_method,
            request_path = %self.request_path,
            trace_id = self.trace_id.as_deref().unwrap_or("-"),
        )
    }
}
