//! Invoke families: deriving the seven correlated descriptors that
//! implement one RPC method from a single user tag.

use crate::descriptor::{EventDescriptor, InvokeRole};
use crate::id::generate_invoke_id;

/// The envelope body shape carried by `send`/`receive` descriptors: either
/// a plain request/response or one chunk of a streamed one.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InvokeBody<T> {
    /// The per-call correlation id.
    #[serde(rename = "invokeId")]
    pub invoke_id: String,
    /// The carried payload.
    pub content: T,
    /// Present and `true` on `send` chunks that are part of a
    /// client-streaming request; absent for a plain unary request.
    #[serde(rename = "isReqStream", skip_serializing_if = "Option::is_none")]
    pub is_req_stream: Option<bool>,
}

impl<T> InvokeBody<T> {
    /// Build a plain (non-streaming) invoke body.
    pub fn unary(invoke_id: impl Into<String>, content: T) -> Self {
        InvokeBody {
            invoke_id: invoke_id.into(),
            content,
            is_req_stream: None,
        }
    }

    /// Build an invoke body tagged as one chunk of a streamed request.
    pub fn stream_chunk(invoke_id: impl Into<String>, content: T) -> Self {
        InvokeBody {
            invoke_id: invoke_id.into(),
            content,
            is_req_stream: Some(true),
        }
    }
}

/// The envelope body shape carried by the two error descriptors.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InvokeErrorBody {
    /// The per-call correlation id.
    #[serde(rename = "invokeId")]
    pub invoke_id: String,
    /// The carried error value.
    pub error: serde_json::Value,
}

/// The envelope body shape carried by the two terminator descriptors
/// (`send-stream-end`, `receive-stream-end`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InvokeEndBody {
    /// The per-call correlation id.
    #[serde(rename = "invokeId")]
    pub invoke_id: String,
}

/// The envelope body shape carried by `send-abort`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InvokeAbortBody {
    /// The per-call correlation id.
    #[serde(rename = "invokeId")]
    pub invoke_id: String,
    /// An optional human-readable abort reason.
    pub reason: Option<String>,
}

/// The seven descriptors derived from one user tag that together implement
/// one invoke (RPC) method. Purely derived: re-invoking
/// [`InvokeFamily::new`] with the same tag yields descriptors comparing
/// equal on id, and the family itself holds no mutable state.
#[derive(Debug, Clone)]
pub struct InvokeFamily {
    tag: String,
}

impl InvokeFamily {
    /// Derive a family from a user-chosen tag.
    pub fn new(tag: impl Into<String>) -> Self {
        InvokeFamily { tag: tag.into() }
    }

    /// Derive a family from a freshly generated tag.
    pub fn generated() -> Self {
        InvokeFamily::new(generate_invoke_id())
    }

    /// The user tag this family was derived from.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// `<tag>-send`
    pub fn send<T>(&self) -> EventDescriptor<InvokeBody<T>> {
        EventDescriptor::new(format!("{}-send", self.tag)).with_invoke_role(InvokeRole::Send)
    }

    /// `<tag>-send-error`
    pub fn send_error(&self) -> EventDescriptor<InvokeErrorBody> {
        EventDescriptor::new(format!("{}-send-error", self.tag))
            .with_invoke_role(InvokeRole::SendError)
    }

    /// `<tag>-send-stream-end`
    pub fn send_stream_end(&self) -> EventDescriptor<InvokeEndBody> {
        EventDescriptor::new(format!("{}-send-stream-end", self.tag))
            .with_invoke_role(InvokeRole::SendStreamEnd)
    }

    /// `<tag>-send-abort`
    pub fn send_abort(&self) -> EventDescriptor<InvokeAbortBody> {
        EventDescriptor::new(format!("{}-send-abort", self.tag))
            .with_invoke_role(InvokeRole::SendAbort)
    }

    /// `<tag>-receive`
    pub fn receive<T>(&self) -> EventDescriptor<InvokeBody<T>> {
        EventDescriptor::new(format!("{}-receive", self.tag)).with_invoke_role(InvokeRole::Receive)
    }

    /// `<tag>-receive-error`
    pub fn receive_error(&self) -> EventDescriptor<InvokeErrorBody> {
        EventDescriptor::new(format!("{}-receive-error", self.tag))
            .with_invoke_role(InvokeRole::ReceiveError)
    }

    /// `<tag>-receive-stream-end`
    pub fn receive_stream_end(&self) -> EventDescriptor<InvokeEndBody> {
        EventDescriptor::new(format!("{}-receive-stream-end", self.tag))
            .with_invoke_role(InvokeRole::ReceiveStreamEnd)
    }

    /// The per-call descriptor a single invocation's response arrives on:
    /// `<tag>-receive-<invokeId>`.
    ///
    /// The three `receive*` family descriptors above name the *shape* of
    /// these events (and are what predicate listeners match against via
    /// their `InvokeRole` marker); the literal id every concrete call
    /// actually emits and listens on is always this per-invocation
    /// derivation, which is what gives concurrent calls on one family bus-
    /// level isolation without either side filtering by `invokeId` in the
    /// listener body.
    pub fn receive_for<T>(&self, invoke_id: &str) -> EventDescriptor<InvokeBody<T>> {
        EventDescriptor::new(format!("{}-{invoke_id}", self.receive::<()>().id()))
            .with_invoke_role(InvokeRole::Receive)
    }

    /// The per-call descriptor an invocation's error arrives on:
    /// `<tag>-receive-error-<invokeId>`.
    pub fn receive_error_for(&self, invoke_id: &str) -> EventDescriptor<InvokeErrorBody> {
        EventDescriptor::new(format!("{}-{invoke_id}", self.receive_error().id()))
            .with_invoke_role(InvokeRole::ReceiveError)
    }

    /// The per-call descriptor a streamed invocation's terminator arrives
    /// on: `<tag>-receive-stream-end-<invokeId>`.
    pub fn receive_stream_end_for(&self, invoke_id: &str) -> EventDescriptor<InvokeEndBody> {
        EventDescriptor::new(format!("{}-{invoke_id}", self.receive_stream_end().id()))
            .with_invoke_role(InvokeRole::ReceiveStreamEnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_is_pure() {
        let a = InvokeFamily::new("greet");
        let b = InvokeFamily::new("greet");
        assert_eq!(a.send::<()>(), b.send::<()>());
        assert_eq!(a.receive_error(), b.receive_error());
    }

    #[test]
    fn suffixes_are_stable() {
        let f = InvokeFamily::new("greet");
        assert_eq!(f.send::<()>().id(), "greet-send");
        assert_eq!(f.send_error().id(), "greet-send-error");
        assert_eq!(f.send_stream_end().id(), "greet-send-stream-end");
        assert_eq!(f.send_abort().id(), "greet-send-abort");
        assert_eq!(f.receive::<()>().id(), "greet-receive");
        assert_eq!(f.receive_error().id(), "greet-receive-error");
        assert_eq!(f.receive_stream_end().id(), "greet-receive-stream-end");
    }

    #[test]
    fn per_call_receive_descriptors_isolate_by_invoke_id() {
        let f = InvokeFamily::new("greet");
        let a = f.receive_for::<()>("abc");
        let b = f.receive_for::<()>("xyz");
        assert_ne!(a, b);
        assert_eq!(a.id(), "greet-receive-abc");
    }
}
