//! Per-call options shared by unary and streaming invokes.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Side-channel options a caller can attach to one invoke call.
#[derive(Clone, Default)]
pub struct InvokeOptions {
    /// A cooperative cancellation signal. If already tripped before the
    /// call begins, the call is aborted immediately; otherwise the call
    /// subscribes to its first trip.
    pub cancel: Option<CancellationToken>,
    /// Transport-specific side-channel payload forwarded untouched on every
    /// descriptor this call emits (minus `cancel`, which is never forwarded
    /// onto the wire).
    pub extra: Option<Value>,
}

impl InvokeOptions {
    /// No cancellation signal, no side-channel payload.
    pub fn none() -> Self {
        Self::default()
    }

    /// Attach a cancellation signal.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Attach a side-channel payload.
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// The shape a server handler's return value may take when it needs to
/// carry side-channel options alongside its response, recognized by the
/// unary and streaming servers as the invoke-response shape.
pub struct HandlerResponse<T> {
    /// The response payload delivered as `content`.
    pub response: T,
    /// Side-channel options carried on the `receive` emission.
    pub extra: Option<Value>,
}

impl<T> HandlerResponse<T> {
    /// Wrap a plain response with no side-channel payload.
    pub fn plain(response: T) -> Self {
        HandlerResponse {
            response,
            extra: None,
        }
    }

    /// Wrap a response together with a side-channel payload.
    pub fn with_extra(response: T, extra: Value) -> Self {
        HandlerResponse {
            response,
            extra: Some(extra),
        }
    }
}

impl<T> From<T> for HandlerResponse<T> {
    fn from(response: T) -> Self {
        HandlerResponse::plain(response)
    }
}
