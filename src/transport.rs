//! The transport adapter contract: the minimal interface a concrete
//! transport implements to plug a [`Context`] into the outside world, plus
//! an in-process reference adapter for wiring two contexts together without
//! a real wire format.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bus::{Context, EmitOptions};
use crate::descriptor::{EventDescriptor, FlowDirection};
use crate::id::generate_invoke_id;
use crate::matcher::Match;

/// A frame crossing the transport boundary in either direction.
///
/// `id` is the frame's own identity (useful for transport-level
/// acknowledgement or dedup); `descriptor` is the bus descriptor id the
/// frame targets. Both travel on the wire — format choice beyond that is
/// left to the adapter.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Frame {
    /// This frame's own identity, distinct from the descriptor it carries.
    pub id: String,
    /// Always `"event"` for this runtime; kept as a field so adapters that
    /// frame other message kinds over the same wire can tell them apart.
    pub r#type: String,
    /// The bus descriptor id this frame's body was emitted against.
    pub descriptor: String,
    /// The event body, already reduced to its JSON representation.
    pub body: Value,
}

impl Frame {
    /// Build a frame from an outbound descriptor id and body, generating a
    /// fresh frame id.
    pub fn new(descriptor: impl Into<String>, body: Value) -> Self {
        Frame {
            id: generate_invoke_id(),
            r#type: "event".to_string(),
            descriptor: descriptor.into(),
            body,
        }
    }
}

/// What a concrete transport must provide to be driven by [`attach`].
///
/// Mirrors the shape of a request/response-capable IPC transport (a
/// send-side and a receive-side) narrowed to exactly the two calls the
/// adapter contract needs: publish one outbound frame, and hand back the
/// next inbound one.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// A name for this transport, used in tracing and in the synthesized
    /// fatal-error descriptor id (`<name>-fatal`).
    fn name(&self) -> &str;

    /// Publish one outbound frame on the native transport.
    ///
    /// ## Errors
    /// Returning `Err` here is treated as a transport-level fatal event —
    /// [`attach`] emits the adapter's fatal descriptor and stops the
    /// outbound pump.
    async fn publish_outbound(&self, frame: Frame) -> Result<(), TransportFailure>;

    /// Wait for and return the next inbound frame, or `None` once the
    /// transport has closed (e.g. the peer disconnected cleanly).
    ///
    /// A single frame that fails to parse on the wire should be reported
    /// through `Ok(Err(..))` rather than failing the whole call, so
    /// [`attach`] can treat it as the contract's non-fatal per-frame error
    /// channel and keep pulling.
    async fn deliver_inbound(&mut self) -> Option<Result<Frame, TransportFailure>>;
}

/// A transport-level failure: a connection drop, a malformed frame, or
/// anything else the adapter wants surfaced through the bus rather than
/// silently dropped.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportFailure(pub String);

impl TransportFailure {
    /// Build a failure from any displayable error.
    pub fn new(err: impl std::fmt::Display) -> Self {
        TransportFailure(err.to_string())
    }
}

/// A live wiring between a [`Context`] and a [`TransportAdapter`].
///
/// Dropping this handle does not stop the background pumps — call
/// [`Self::shutdown`] to stop them explicitly, mirroring the explicit
/// `.dispose()` style used by the invoke handler disposers.
pub struct AttachedTransport {
    outbound: tokio::task::JoinHandle<()>,
    inbound: tokio::task::JoinHandle<()>,
    unsubscribe: Arc<dyn Fn() + Send + Sync>,
}

impl AttachedTransport {
    /// Stop both background pumps and remove the outbound wildcard
    /// listener. Safe to call more than once.
    pub fn shutdown(&self) {
        self.outbound.abort();
        self.inbound.abort();
        (self.unsubscribe)();
    }
}

/// Plug `adapter` into `ctx`, implementing the transport adapter contract:
///
/// 1. Subscribe to a wildcard match that picks up every outbound-directed
///    or undirected descriptor, and publish each such emission on the
///    native transport as a framed payload.
/// 2. Pull frames off the transport's inbound channel; re-emit each as an
///    inbound-directed descriptor on the bus with the parsed body.
/// 3. On a transport-level fatal event (the publish or deliver call
///    itself failing), emit `<name>-fatal` and stop; the caller may
///    register that descriptor as a fatal source via
///    [`Context::register_fatal_source`].
/// 4. On a single frame failing to parse (the inbound channel yielding
///    `Some(Err(..))`), emit `<name>-frame-error` and keep the bus alive.
pub fn attach(ctx: &Context, adapter: impl TransportAdapter + 'static) -> AttachedTransport {
    let name = adapter.name().to_string();
    let fatal_descriptor = EventDescriptor::<Value>::new(format!("{name}-fatal"));
    let frame_error_descriptor = EventDescriptor::<Value>::new(format!("{name}-frame-error"));

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let outbound_only_or_undirected = Match::predicate(|meta| meta.flow_direction != Some(FlowDirection::Inbound));
    let listener_name = name.clone();
    let listener: crate::bus::ListenerFn = Arc::new(move |envelope: &crate::bus::Envelope, _options: &EmitOptions| {
        let frame = Frame::new(envelope.id.clone(), envelope.body.clone());
        if outbound_tx.send(frame).is_err() {
            tracing::debug!(name = %listener_name, "outbound pump already stopped; dropping emission");
        }
    });
    ctx.on(outbound_only_or_undirected.clone(), listener.clone());

    let adapter = Arc::new(tokio::sync::Mutex::new(adapter));

    let outbound_adapter = adapter.clone();
    let outbound_ctx = ctx.clone();
    let outbound_name = name.clone();
    let outbound_fatal = fatal_descriptor.clone();
    let outbound = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let result = { outbound_adapter.lock().await.publish_outbound(frame).await };
            if let Err(err) = result {
                tracing::error!(name = %outbound_name, error = %err, "outbound transport failure");
                outbound_ctx.emit(&outbound_fatal, Value::String(err.0), None);
                break;
            }
        }
    });

    let inbound_adapter = adapter;
    let inbound_ctx = ctx.clone();
    let inbound_name = name.clone();
    let inbound_fatal = fatal_descriptor;
    let inbound_frame_error = frame_error_descriptor;
    let inbound = tokio::spawn(async move {
        loop {
            let next = { inbound_adapter.lock().await.deliver_inbound().await };
            match next {
                None => break,
                Some(Ok(frame)) => {
                    inbound_ctx.emit_raw(&frame.descriptor, Some(FlowDirection::Inbound), frame.body, None);
                }
                Some(Err(err)) => {
                    tracing::warn!(name = %inbound_name, error = %err, "inbound frame failed to parse");
                    inbound_ctx.emit(&inbound_frame_error, Value::String(err.0), None);
                }
            }
        }
    });

    let unsubscribe_ctx = ctx.clone();
    let unsubscribe = Arc::new(move || {
        unsubscribe_ctx.off(outbound_only_or_undirected.clone(), Some(&listener));
    });

    AttachedTransport {
        outbound,
        inbound,
        unsubscribe,
    }
}

/// An in-process reference adapter: two [`InProcessAdapter`] endpoints
/// sharing a pair of channels behave like a transport connecting two
/// contexts, without any real wire format. Useful for tests and for
/// demonstrating the adapter contract end to end.
pub struct InProcessAdapter {
    name: String,
    outbox: mpsc::UnboundedSender<Frame>,
    inbox: mpsc::UnboundedReceiver<Frame>,
}

impl InProcessAdapter {
    /// Build a connected pair: frames published on one side arrive as
    /// inbound frames on the other.
    pub fn pair(name_a: impl Into<String>, name_b: impl Into<String>) -> (Self, Self) {
        let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
        let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();
        let a = InProcessAdapter {
            name: name_a.into(),
            outbox: a_to_b_tx,
            inbox: b_to_a_rx,
        };
        let b = InProcessAdapter {
            name: name_b.into(),
            outbox: b_to_a_tx,
            inbox: a_to_b_rx,
        };
        (a, b)
    }
}

#[async_trait]
impl TransportAdapter for InProcessAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish_outbound(&self, frame: Frame) -> Result<(), TransportFailure> {
        self.outbox
            .send(frame)
            .map_err(|_| TransportFailure::new("peer endpoint dropped"))
    }

    async fn deliver_inbound(&mut self) -> Option<Result<Frame, TransportFailure>> {
        self.inbox.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::EventDescriptor;
    use std::time::Duration;

    #[tokio::test]
    async fn a_plain_emission_crosses_to_the_peer_context() {
        let ctx_a = Context::new();
        let ctx_b = Context::new();
        let (adapter_a, adapter_b) = InProcessAdapter::pair("a", "b");
        let _handle_a = attach(&ctx_a, adapter_a);
        let _handle_b = attach(&ctx_b, adapter_b);

        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let descriptor = EventDescriptor::<Value>::new("ping");
        ctx_b.on(
            Match::from(&descriptor),
            Arc::new(move |envelope: &crate::bus::Envelope, _: &EmitOptions| {
                let _ = tx.send(envelope.body.clone());
            }),
        );

        ctx_a.emit(&descriptor, serde_json::json!({"hello": "world"}), None);

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("peer should receive the frame before the timeout")
            .expect("channel should not have closed");
        assert_eq!(received, serde_json::json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn inbound_frames_are_not_re_published_outbound() {
        let ctx_a = Context::new();
        let ctx_b = Context::new();
        let (adapter_a, adapter_b) = InProcessAdapter::pair("a", "b");
        let _handle_a = attach(&ctx_a, adapter_a);
        let _handle_b = attach(&ctx_b, adapter_b);

        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let descriptor = EventDescriptor::<Value>::new("echo");
        {
            let seen = seen.clone();
            ctx_a.on(
                Match::from(&descriptor),
                Arc::new(move |_: &crate::bus::Envelope, _: &EmitOptions| {
                    seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }),
            );
        }

        ctx_a.emit(&descriptor, serde_json::json!(1), None);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            seen.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "ctx_a's own listener should see exactly one emission, not a bounced-back copy from ctx_b re-publishing the inbound frame"
        );
    }
}
