//! The event bus (`Context`): an in-process multi-publisher/multi-subscriber
//! registry over event descriptors.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;

use crate::descriptor::{EventDescriptor, FlowDirection};
use crate::error::PanicMessage;
use crate::matcher::{DescriptorMeta, Match};

/// What actually travels on the bus for one emission.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The descriptor id this envelope was emitted against.
    pub id: String,
    /// The envelope kind; always `"event"` for this runtime.
    pub r#type: &'static str,
    /// The event body, already converted to its JSON representation.
    pub body: Value,
    /// The flow-direction marker carried by the originating descriptor, if any.
    pub flow_direction: Option<FlowDirection>,
}

/// Per-emit side-channel options, forwarded opaquely to listeners.
///
/// Transports use this to carry hints the bus itself does not interpret
/// (e.g. a transferable-object list, or a raw native message handle); the
/// invoke layer uses `extra` to carry a handler's `{response, extra}` return
/// shape through to the emitting side.
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    /// Transport- or handler-specific side-channel payload.
    pub extra: Option<Value>,
}

/// A registered listener: receives the full envelope and the side-channel
/// options for every matching emission.
pub type ListenerFn = Arc<dyn Fn(&Envelope, &EmitOptions) + Send + Sync>;

/// Hook invoked when a listener panics, so panics are observable without
/// taking down the emitting task. Receives the offending descriptor id and
/// a message describing the panic.
pub type ListenerErrorHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct Entry {
    matcher: Match,
    listener: ListenerFn,
}

/// Which bare target a `Match` addresses, used only to decide whether two
/// registrations are "the same target" for dedup/removal purposes. Broad
/// predicate/combinator matchers are keyed by their own construction-time
/// identity (`Match::identity`), so two separately built matchers — even
/// with identical closures or sub-expressions — are never considered equal
/// to one another, while clones of the same `Match` value are.
#[derive(PartialEq, Eq)]
enum TargetKey {
    Literal(String),
    Wildcard,
    Other(u64),
}

fn target_key(m: &Match) -> TargetKey {
    match m.as_literal() {
        Some(id) => TargetKey::Literal(id.to_string()),
        None => match m {
            Match::Wildcard => TargetKey::Wildcard,
            _ => TargetKey::Other(m.identity().expect("non-literal, non-wildcard match always has an identity")),
        },
    }
}

struct ContextInner {
    entries: RwLock<Vec<Entry>>,
    on_error: RwLock<Option<ListenerErrorHook>>,
    fatal_listeners: RwLock<Vec<(u64, Arc<dyn Fn(Value) + Send + Sync>)>>,
    next_fatal_id: AtomicU64,
    handler_listeners: RwLock<HashMap<(String, usize), (ListenerFn, ListenerFn, ListenerFn)>>,
}

/// The in-process publish/subscribe registry. Cheap to clone — clones share
/// the same underlying registry, mirroring how a transport adapter and the
/// invoke factories built on top of one context all need a handle to it.
#[derive(Clone)]
pub struct Context(Arc<ContextInner>);

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a fresh, empty context.
    pub fn new() -> Self {
        Context(Arc::new(ContextInner {
            entries: RwLock::new(Vec::new()),
            on_error: RwLock::new(None),
            fatal_listeners: RwLock::new(Vec::new()),
            next_fatal_id: AtomicU64::new(0),
            handler_listeners: RwLock::new(HashMap::new()),
        }))
    }

    /// Register a listener against a match expression.
    ///
    /// Registering the same listener (by `Arc` identity) against the same
    /// target twice is a no-op, whether that target is a literal id, the
    /// wildcard, or a predicate/combinator match (matched by that match
    /// value's own construction-time identity, not structural equality —
    /// see `Match::identity`).
    pub fn on(&self, matcher: impl Into<Match>, listener: ListenerFn) {
        let matcher = matcher.into();
        let mut entries = self.0.entries.write().unwrap();
        let key = target_key(&matcher);
        let dup = entries
            .iter()
            .any(|e| target_key(&e.matcher) == key && Arc::ptr_eq(&e.listener, &listener));
        if dup {
            return;
        }
        entries.push(Entry { matcher, listener });
    }

    /// Remove one listener for a target, or every listener for it when
    /// `listener` is `None`.
    pub fn off(&self, matcher: impl Into<Match>, listener: Option<&ListenerFn>) {
        let matcher = matcher.into();
        let key = target_key(&matcher);
        let mut entries = self.0.entries.write().unwrap();
        entries.retain(|e| {
            if target_key(&e.matcher) != key {
                return true;
            }
            match listener {
                Some(l) => !Arc::ptr_eq(&e.listener, l),
                None => false,
            }
        });
    }

    /// Register a hook called whenever a listener panics during dispatch.
    /// Replaces any previously registered hook.
    pub fn on_listener_error(&self, hook: ListenerErrorHook) {
        *self.0.on_error.write().unwrap() = Some(hook);
    }

    /// Synchronously dispatch `body` to every listener whose match expression
    /// accepts `descriptor`, in registration order.
    ///
    /// A listener that panics does not prevent its siblings from running;
    /// the panic is reported to the `on_listener_error` hook (if any) and to
    /// `tracing`, then swallowed. Listeners registered during this call are
    /// not invoked for this emission, since the entry list is snapshotted
    /// before dispatch begins.
    pub fn emit<T: Serialize>(
        &self,
        descriptor: &EventDescriptor<T>,
        body: T,
        options: Option<EmitOptions>,
    ) {
        let value = match serde_json::to_value(&body) {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(
                    descriptor = descriptor.id(),
                    error = %err,
                    "failed to serialize event body; emitting null body"
                );
                Value::Null
            }
        };
        let envelope = Envelope {
            id: descriptor.id().to_string(),
            r#type: "event",
            body: value,
            flow_direction: descriptor.flow_direction(),
        };
        let meta = DescriptorMeta::from(descriptor);
        self.dispatch(envelope, meta, options.unwrap_or_default());
    }

    /// Emit a pre-serialized body against a descriptor id chosen at
    /// runtime, bypassing the need for a typed `EventDescriptor<T>` at the
    /// call site.
    ///
    /// Used by transport adapters re-emitting an inbound frame: the frame
    /// arrives as `{descriptor id, body}` off the wire with no static
    /// payload type attached, so there is nothing to hand `emit` as `T`.
    /// `invoke_role` is left unset on the dispatched metadata — every
    /// routing path that matters for invoke traffic keys off the literal
    /// descriptor id, not the role predicate, so re-emitted frames still
    /// reach their listeners.
    pub fn emit_raw(&self, id: &str, flow_direction: Option<FlowDirection>, body: Value, options: Option<EmitOptions>) {
        let envelope = Envelope {
            id: id.to_string(),
            r#type: "event",
            body,
            flow_direction,
        };
        let meta = DescriptorMeta {
            id: id.to_string(),
            flow_direction,
            invoke_role: None,
        };
        self.dispatch(envelope, meta, options.unwrap_or_default());
    }

    fn dispatch(&self, envelope: Envelope, meta: DescriptorMeta, options: EmitOptions) {
        let snapshot: Vec<(Match, ListenerFn)> = {
            let entries = self.0.entries.read().unwrap();
            entries
                .iter()
                .map(|e| (e.matcher.clone(), e.listener.clone()))
                .collect()
        };

        for (matcher, listener) in snapshot {
            if !matcher.matches(&meta) {
                continue;
            }
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                listener(&envelope, &options);
            }));
            if let Err(panic) = result {
                let message = PanicMessage(panic.as_ref()).to_string();
                tracing::error!(
                    descriptor = envelope.id,
                    panic = %message,
                    "event listener panicked"
                );
                if let Some(hook) = self.0.on_error.read().unwrap().as_ref() {
                    hook(&envelope.id, &message);
                }
            }
        }
    }

    /// Number of currently registered listeners whose target matches `matcher`.
    pub fn listener_count(&self, matcher: impl Into<Match>) -> usize {
        let matcher = matcher.into();
        self.0
            .entries
            .read()
            .unwrap()
            .iter()
            .filter(|e| target_key(&e.matcher) == target_key(&matcher))
            .count()
    }

    /// Whether any listener is currently registered for `matcher`.
    pub fn has_listeners(&self, matcher: impl Into<Match>) -> bool {
        self.listener_count(matcher) > 0
    }

    /// Register `matcher` as a fatal-event source (see [`crate::invoke::cancellation`]).
    ///
    /// Additive: each call adds a further source without disturbing
    /// previously registered ones. When a matching event fires, every
    /// currently registered fatal listener is invoked with the event body
    /// and then cleared.
    pub fn register_fatal_source(&self, matcher: impl Into<Match>) {
        let ctx = self.clone();
        self.on(
            matcher,
            Arc::new(move |envelope: &Envelope, _options: &EmitOptions| {
                ctx.fire_fatal(envelope.body.clone());
            }),
        );
    }

    /// Register a one-shot fatal listener; returns a token used to
    /// unregister it early if the call settles normally first.
    pub(crate) fn register_fatal_listener(&self, f: Arc<dyn Fn(Value) + Send + Sync>) -> u64 {
        let id = self.0.next_fatal_id.fetch_add(1, Ordering::Relaxed);
        self.0.fatal_listeners.write().unwrap().push((id, f));
        id
    }

    pub(crate) fn unregister_fatal_listener(&self, id: u64) {
        self.0.fatal_listeners.write().unwrap().retain(|(i, _)| *i != id);
    }

    /// Memoized per-handler listener wrappers, keyed by a caller-chosen tag
    /// (e.g. the family's `send` descriptor id) plus the underlying
    /// handler's own `Arc` identity.
    ///
    /// `define_invoke_handler`/`define_stream_invoke_handler` build three
    /// `ListenerFn` closures that wrap a handler `Arc` to register it on the
    /// bus. Since `on`'s dedup compares `ListenerFn` by `Arc::ptr_eq`, two
    /// calls with the same handler must hand back the *same* wrapper
    /// instances, or the second call's registrations would be indistinguishable
    /// from a second, independent handler. This cache is what makes that true.
    pub(crate) fn handler_listeners(
        &self,
        key: &str,
        handler_ptr: usize,
        build: impl FnOnce() -> (ListenerFn, ListenerFn, ListenerFn),
    ) -> (ListenerFn, ListenerFn, ListenerFn) {
        let cache_key = (key.to_string(), handler_ptr);
        if let Some(cached) = self.0.handler_listeners.read().unwrap().get(&cache_key) {
            return cached.clone();
        }
        let mut cache = self.0.handler_listeners.write().unwrap();
        if let Some(cached) = cache.get(&cache_key) {
            return cached.clone();
        }
        let built = build();
        cache.insert(cache_key, built.clone());
        built
    }

    /// Drop the memoized wrappers for a handler registration, so that a
    /// later `define_invoke_handler`/`define_stream_invoke_handler` call
    /// with the same handler pointer builds a fresh registration rather
    /// than reviving one whose disposer already ran.
    pub(crate) fn forget_handler_listeners(&self, key: &str, handler_ptr: usize) {
        self.0.handler_listeners.write().unwrap().remove(&(key.to_string(), handler_ptr));
    }

    fn fire_fatal(&self, value: Value) {
        let listeners: Vec<_> = {
            let mut guard = self.0.fatal_listeners.write().unwrap();
            std::mem::take(&mut *guard)
        };
        for (_, listener) in listeners {
            listener(value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_dispatches_in_registration_order() {
        let ctx = Context::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            ctx.on(
                Match::literal("tick"),
                Arc::new(move |_e: &Envelope, _o: &EmitOptions| {
                    order.lock().unwrap().push(n);
                }),
            );
        }
        let descriptor = EventDescriptor::<u32>::new("tick");
        ctx.emit(&descriptor, 1, None);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn duplicate_listener_registration_is_a_no_op() {
        let ctx = Context::new();
        let count = Arc::new(AtomicUsize::new(0));
        let listener: ListenerFn = {
            let count = count.clone();
            Arc::new(move |_e: &Envelope, _o: &EmitOptions| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        ctx.on(Match::literal("x"), listener.clone());
        ctx.on(Match::literal("x"), listener);
        assert_eq!(ctx.listener_count(Match::literal("x")), 1);

        let descriptor = EventDescriptor::<u32>::new("x");
        ctx.emit(&descriptor, 1, None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_without_listener_removes_all() {
        let ctx = Context::new();
        ctx.on(Match::literal("x"), Arc::new(|_: &Envelope, _: &EmitOptions| {}));
        ctx.on(Match::literal("x"), Arc::new(|_: &Envelope, _: &EmitOptions| {}));
        assert_eq!(ctx.listener_count(Match::literal("x")), 2);
        ctx.off(Match::literal("x"), None);
        assert_eq!(ctx.listener_count(Match::literal("x")), 0);
    }

    #[test]
    fn panicking_listener_does_not_stop_siblings() {
        let ctx = Context::new();
        let ran = Arc::new(AtomicUsize::new(0));
        ctx.on(
            Match::literal("x"),
            Arc::new(|_: &Envelope, _: &EmitOptions| panic!("boom")),
        );
        {
            let ran = ran.clone();
            ctx.on(
                Match::literal("x"),
                Arc::new(move |_: &Envelope, _: &EmitOptions| {
                    ran.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        let descriptor = EventDescriptor::<u32>::new("x");
        ctx.emit(&descriptor, 1, None);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_listener_sees_every_descriptor() {
        let ctx = Context::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            ctx.on(
                Match::wildcard(),
                Arc::new(move |e: &Envelope, _: &EmitOptions| {
                    seen.lock().unwrap().push(e.id.clone());
                }),
            );
        }
        ctx.emit(&EventDescriptor::<u32>::new("a"), 1, None);
        ctx.emit(&EventDescriptor::<u32>::new("b"), 2, None);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }
}
