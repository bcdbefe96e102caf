//! Error types for the event bus and invoke runtime.

use std::fmt;

/// The crate's single public error type.
///
/// Mirrors the error kinds enumerated in the runtime's design: a handler
/// error and a request-producer error carry the original value (as JSON) so
/// callers can recover it; `Aborted` is the canonical cancellation error
/// named so callers can match on it by kind; `Fatal` carries a transport's
/// terminal failure; `ProtocolGuard` is raised synchronously at the
/// remote-methods serialize/deserialize boundary.
#[derive(Debug, thiserror::Error)]
pub enum EventaError {
    /// The peer's handler raised; carries the thrown value as delivered on
    /// `receive-error-<id>`.
    #[error("handler error: {0}")]
    Handler(serde_json::Value),

    /// The client's request-producing stream raised while being pumped.
    #[error("request producer error: {0}")]
    RequestProducer(serde_json::Value),

    /// A cancellation signal tripped, or the peer sent `send-abort-<id>`.
    #[error("Aborted{}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Aborted {
        /// Optional human-readable reason carried with the abort.
        reason: Option<String>,
    },

    /// The context's registered fatal-event source fired; every pending
    /// call on the context is rejected with this error.
    #[error("fatal transport error: {0}")]
    Fatal(serde_json::Value),

    /// A malformed remote-method stub in `strict` mode, or a payload that
    /// exceeded the configured depth/function-count limits.
    #[error("protocol guard violation: {0}")]
    ProtocolGuard(String),

    /// The bus emitted an event with a body that did not match the shape
    /// expected by the listener that tried to decode it.
    #[error("event body mismatch for {descriptor_id}: {detail}")]
    BodyMismatch {
        /// The descriptor id whose body failed to decode.
        descriptor_id: String,
        /// What went wrong.
        detail: String,
    },
}

impl EventaError {
    /// Build the canonical "Aborted" error with no reason.
    pub fn aborted() -> Self {
        EventaError::Aborted { reason: None }
    }

    /// Build the canonical "Aborted" error carrying a reason.
    pub fn aborted_with(reason: impl Into<String>) -> Self {
        EventaError::Aborted {
            reason: Some(reason.into()),
        }
    }

    /// True if this error is the canonical cancellation error, regardless
    /// of whether it carries a reason.
    pub fn is_aborted(&self) -> bool {
        matches!(self, EventaError::Aborted { .. })
    }
}

/// A lightweight display wrapper used when logging listener panics; panics
/// can carry arbitrary payloads (`Box<dyn Any + Send>`), most commonly
/// `&str` or `String`.
pub(crate) struct PanicMessage<'a>(pub(crate) &'a (dyn std::any::Any + Send));

impl fmt::Display for PanicMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<&str>() {
            write!(f, "{s}")
        } else if let Some(s) = self.0.downcast_ref::<String>() {
            write!(f, "{s}")
        } else {
            write!(f, "<non-string panic payload>")
        }
    }
}
