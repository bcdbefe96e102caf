//! Remote methods: an opt-in payload transform that lets invoke requests
//! carry function values, by replacing them with stub descriptors on the
//! wire and rehydrating the stubs as invoke clients on the receiving side.
//!
//! `serde_json::Value` has no function variant, so the walk operates over
//! [`RemoteValue`] on the side that may still contain real callables, and
//! over plain `Value` on the wire side. Serializing narrows `RemoteValue`
//! down to `Value`; deserializing widens `Value` back up to `RemoteValue`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::bus::Context;
use crate::error::EventaError;
use crate::id::generate_stub_tag;
use crate::invoke::{
    define_invoke, define_invoke_handler, define_stream_invoke, BoxUnaryHandler, HandlerResponse,
    InvokeClient, InvokeFamily, InvokeOptions, InvokeStreamClient,
};

const MARKER_KEY: &str = "__marker";
const TAG_KEY: &str = "tag";

/// One function value: an opaque JSON-in/JSON-out async callable, the only
/// shape a dynamic walk can treat uniformly regardless of the real
/// request/response types a particular remote method actually carries.
pub type RemoteFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, Value>> + Send + Sync>;

/// A payload that may still carry function values, prior to (or after)
/// being walked by [`serialize`]/[`deserialize`].
pub enum RemoteValue {
    /// A subtree already known to be pure data (no functions anywhere
    /// inside it) — the common case, and the only way a leaf scalar
    /// (string, number, bool, null) is represented.
    Value(Value),
    /// A function value, to be replaced by a stub on serialize.
    Function(RemoteFn),
    /// An array that may contain function values at any position.
    Array(Vec<RemoteValue>),
    /// An object that may contain function values under any key.
    /// Insertion-ordered, mirroring `serde_json::Map`'s default behavior.
    Object(Vec<(String, RemoteValue)>),
}

impl From<Value> for RemoteValue {
    fn from(v: Value) -> Self {
        RemoteValue::Value(v)
    }
}

impl RemoteValue {
    /// Wrap a function value for inclusion in a remote-methods payload.
    pub fn function(f: RemoteFn) -> Self {
        RemoteValue::Function(f)
    }
}

/// Whether a rehydrated stub tag that fails the configured prefix check is
/// dropped silently (left as the raw marker object) or rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDisallowedTag {
    /// Leave the node as plain data.
    Ignore,
    /// Reject the whole deserialize with a protocol-guard error.
    Throw,
}

/// Per-factory (overridable per-call) remote-methods configuration,
/// spec.md §4.7's enumerated options.
#[derive(Debug, Clone)]
pub struct RemoteMethodsConfig {
    /// Master switch; when `false`, [`RemoteInvokeClient::invoke`] and
    /// [`RemoteInvokeStreamClient::invoke`] reject immediately rather than
    /// walking the payload.
    pub allow: bool,
    /// Maximum recursion depth the walk tolerates before failing closed.
    pub max_depth: usize,
    /// Maximum number of function values one walk may stub out or rehydrate.
    pub max_functions: usize,
    /// Prefix every generated stub tag carries, and the prefix deserialize
    /// requires before rehydrating a marker.
    pub tag_prefix: String,
    /// What to do with a marker-shaped node whose tag fails the prefix
    /// check during deserialize.
    pub on_disallowed_tag: OnDisallowedTag,
    /// If set, a call's stub handlers are disposed this many milliseconds
    /// after serialize, regardless of whether the call has settled.
    pub auto_dispose_ms: Option<u64>,
    /// If `true`, a marker-shaped node with a malformed descriptor (missing
    /// or non-string `tag`) is a hard error rather than being ignored.
    pub strict: bool,
}

impl Default for RemoteMethodsConfig {
    fn default() -> Self {
        RemoteMethodsConfig {
            allow: true,
            max_depth: 32,
            max_functions: 64,
            tag_prefix: "rpc-fn-".to_string(),
            on_disallowed_tag: OnDisallowedTag::Ignore,
            auto_dispose_ms: None,
            strict: false,
        }
    }
}

/// Drains and runs every registered teardown callback exactly once, however
/// many times `dispose()` is called or who calls it.
#[derive(Clone)]
pub struct DisposeHandle(Arc<DisposeInner>);

struct DisposeInner {
    disposers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    disposed: AtomicBool,
}

impl DisposeHandle {
    fn new() -> Self {
        DisposeHandle(Arc::new(DisposeInner {
            disposers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }))
    }

    fn push(&self, f: impl FnOnce() + Send + 'static) {
        self.0.disposers.lock().unwrap().push(Box::new(f));
    }

    /// Run every registered teardown once. Safe to call more than once or
    /// from more than one owner — only the first call does anything.
    pub fn dispose(&self) {
        if self
            .0
            .disposed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let fns = std::mem::take(&mut *self.0.disposers.lock().unwrap());
            for f in fns {
                f();
            }
        }
    }
}

/// The result of walking a payload through [`serialize`]: a pure-data
/// `Value` ready to emit, plus the teardown list for the stub handlers it
/// registered.
pub struct SerializedPayload {
    /// The wire-ready value, with every function replaced by a stub marker.
    pub value: Value,
    /// Tears down every stub handler this serialize call registered.
    pub dispose: DisposeHandle,
}

fn is_stub_marker(value: &Value) -> Option<&str> {
    value
        .as_object()
        .and_then(|obj| obj.get(MARKER_KEY))
        .and_then(|marker| marker.as_object())
        .and_then(|marker| marker.get(TAG_KEY))
        .and_then(|tag| tag.as_str())
}

fn stub_marker(tag: &str) -> Value {
    let mut marker = serde_json::Map::new();
    marker.insert(TAG_KEY.to_string(), Value::String(tag.to_string()));
    let mut outer = serde_json::Map::new();
    outer.insert(MARKER_KEY.to_string(), Value::Object(marker));
    Value::Object(outer)
}

/// Walk `value`, replacing every function with a stub marker and
/// registering a server-side handler for it on `ctx`.
pub fn serialize(
    ctx: &Context,
    value: RemoteValue,
    config: &RemoteMethodsConfig,
) -> Result<SerializedPayload, EventaError> {
    let dispose = DisposeHandle::new();
    let mut fn_count = 0usize;
    let out = walk_serialize(ctx, value, 0, &mut fn_count, config, &dispose)?;
    Ok(SerializedPayload { value: out, dispose })
}

fn walk_serialize(
    ctx: &Context,
    value: RemoteValue,
    depth: usize,
    fn_count: &mut usize,
    config: &RemoteMethodsConfig,
    dispose: &DisposeHandle,
) -> Result<Value, EventaError> {
    if depth > config.max_depth {
        return Err(EventaError::ProtocolGuard(format!(
            "remote-methods payload exceeds max depth {}",
            config.max_depth
        )));
    }
    match value {
        RemoteValue::Value(v) => Ok(v),
        RemoteValue::Function(f) => {
            *fn_count += 1;
            if *fn_count > config.max_functions {
                return Err(EventaError::ProtocolGuard(format!(
                    "remote-methods payload exceeds max function count {}",
                    config.max_functions
                )));
            }
            let tag = generate_stub_tag(&config.tag_prefix);
            let family = InvokeFamily::new(tag.clone());
            let handler: BoxUnaryHandler<Value, Value> = Arc::new(move |input, _opts| {
                let f = f.clone();
                Box::pin(async move {
                    let mut input = input;
                    let arg = input.next().await.transpose().map_err(|e| Value::String(e.to_string()))?;
                    let arg = arg.unwrap_or(Value::Null);
                    f(arg).await.map(HandlerResponse::plain)
                })
            });
            let disposer = define_invoke_handler::<Value, Value>(ctx, family, handler);
            dispose.push(move || disposer.dispose());
            Ok(stub_marker(&tag))
        }
        RemoteValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(walk_serialize(ctx, item, depth + 1, fn_count, config, dispose)?);
            }
            Ok(Value::Array(out))
        }
        RemoteValue::Object(entries) => {
            let mut out = serde_json::Map::new();
            for (key, v) in entries {
                out.insert(key, walk_serialize(ctx, v, depth + 1, fn_count, config, dispose)?);
            }
            Ok(Value::Object(out))
        }
    }
}

/// Walk `value`, replacing every stub marker whose tag passes the prefix
/// check with a callable backed by a freshly bound invoke client.
pub fn deserialize(
    ctx: &Context,
    value: Value,
    config: &RemoteMethodsConfig,
) -> Result<RemoteValue, EventaError> {
    let mut fn_count = 0usize;
    walk_deserialize(ctx, value, 0, &mut fn_count, config)
}

fn walk_deserialize(
    ctx: &Context,
    value: Value,
    depth: usize,
    fn_count: &mut usize,
    config: &RemoteMethodsConfig,
) -> Result<RemoteValue, EventaError> {
    if depth > config.max_depth {
        return Err(EventaError::ProtocolGuard(format!(
            "remote-methods payload exceeds max depth {}",
            config.max_depth
        )));
    }
    if let Some(tag) = is_stub_marker(&value) {
        if tag.starts_with(&config.tag_prefix) {
            *fn_count += 1;
            if *fn_count > config.max_functions {
                return Err(EventaError::ProtocolGuard(format!(
                    "remote-methods payload exceeds max function count {}",
                    config.max_functions
                )));
            }
            let client = define_invoke::<Value, Value>(ctx, InvokeFamily::new(tag));
            let stub: RemoteFn = Arc::new(move |arg: Value| {
                let client = client.clone();
                Box::pin(async move {
                    client
                        .invoke(arg, InvokeOptions::none())
                        .await
                        .map_err(|e| Value::String(e.to_string()))
                }) as Pin<Box<dyn Future<Output = Result<Value, Value>> + Send>>
            });
            return Ok(RemoteValue::Function(stub));
        }
        return match config.on_disallowed_tag {
            OnDisallowedTag::Ignore => Ok(RemoteValue::Value(value)),
            OnDisallowedTag::Throw => Err(EventaError::ProtocolGuard(format!(
                "remote-methods stub tag '{tag}' does not match configured prefix"
            ))),
        };
    }
    if config.strict && has_malformed_marker(&value) {
        return Err(EventaError::ProtocolGuard(
            "remote-methods marker key present with a malformed descriptor".to_string(),
        ));
    }
    match value {
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(walk_deserialize(ctx, item, depth + 1, fn_count, config)?);
            }
            Ok(RemoteValue::Array(out))
        }
        Value::Object(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (key, v) in entries {
                out.push((key, walk_deserialize(ctx, v, depth + 1, fn_count, config)?));
            }
            Ok(RemoteValue::Object(out))
        }
        leaf => Ok(RemoteValue::Value(leaf)),
    }
}

fn has_malformed_marker(value: &Value) -> bool {
    match value.as_object().and_then(|obj| obj.get(MARKER_KEY)) {
        None => false,
        Some(marker) => is_stub_marker(value).is_none() && !marker.is_null(),
    }
}

fn schedule_auto_dispose(config: &RemoteMethodsConfig, dispose: DisposeHandle) {
    if let Some(ms) = config.auto_dispose_ms {
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            dispose.dispose();
        });
    }
}

/// The client-factory overrides spec.md §4.7 calls `withRemoteMethods`:
/// the same `defineInvoke`/`defineStreamInvoke` pair, but their clients
/// walk the request for function values before emitting it and the
/// response for stub markers after receiving it, and tie the request-side
/// stub handlers' lifetime to the call.
#[derive(Clone)]
pub struct RemoteMethods {
    ctx: Context,
    defaults: RemoteMethodsConfig,
}

/// Build the remote-methods client-factory overrides, configured with
/// `defaults` (overridable per call via `invoke_with`).
pub fn with_remote_methods(ctx: &Context, defaults: RemoteMethodsConfig) -> RemoteMethods {
    RemoteMethods {
        ctx: ctx.clone(),
        defaults,
    }
}

impl RemoteMethods {
    /// Override of `defineInvoke` whose client transforms its request and
    /// response payloads through [`serialize`]/[`deserialize`].
    pub fn define_invoke(&self, family: InvokeFamily) -> RemoteInvokeClient {
        RemoteInvokeClient {
            ctx: self.ctx.clone(),
            inner: define_invoke::<Value, Value>(&self.ctx, family),
            defaults: self.defaults.clone(),
        }
    }

    /// Override of `defineStreamInvoke`, same transform applied to each
    /// streamed response.
    pub fn define_stream_invoke(&self, family: InvokeFamily) -> RemoteInvokeStreamClient {
        RemoteInvokeStreamClient {
            ctx: self.ctx.clone(),
            inner: define_stream_invoke::<Value, Value>(&self.ctx, family),
            defaults: self.defaults.clone(),
        }
    }
}

/// The client half of a remote-methods-wrapped unary invoke, built by
/// [`RemoteMethods::define_invoke`].
pub struct RemoteInvokeClient {
    ctx: Context,
    inner: InvokeClient<Value, Value>,
    defaults: RemoteMethodsConfig,
}

impl RemoteInvokeClient {
    /// Issue one call using the factory's default remote-methods configuration.
    pub fn invoke(&self, req: RemoteValue, options: InvokeOptions) -> RemoteCall {
        self.invoke_with(req, options, self.defaults.clone())
    }

    /// Issue one call, overriding the factory defaults for just this call.
    pub fn invoke_with(&self, req: RemoteValue, options: InvokeOptions, config: RemoteMethodsConfig) -> RemoteCall {
        if !config.allow {
            return RemoteCall::ready(Err(EventaError::ProtocolGuard(
                "remote methods disabled by configuration".to_string(),
            )));
        }
        let serialized = match serialize(&self.ctx, req, &config) {
            Ok(s) => s,
            Err(err) => return RemoteCall::ready(Err(err)),
        };
        let dispose = serialized.dispose;
        schedule_auto_dispose(&config, dispose.clone());

        let ctx = self.ctx.clone();
        let inner = self.inner.clone();
        let value = serialized.value;
        let dispose_for_future = dispose.clone();
        let fut: BoxFuture<'static, Result<RemoteValue, EventaError>> = Box::pin(async move {
            let result = inner.invoke(value, options).await;
            let out = result.and_then(|v| deserialize(&ctx, v, &config));
            // Fulfilled or rejected: either way nothing further will ever
            // call back through the stub handlers this call registered.
            dispose_for_future.dispose();
            out
        });
        RemoteCall { dispose, inner: fut }
    }
}

/// The client half of a remote-methods-wrapped streaming invoke, built by
/// [`RemoteMethods::define_stream_invoke`].
pub struct RemoteInvokeStreamClient {
    ctx: Context,
    inner: InvokeStreamClient<Value, Value>,
    defaults: RemoteMethodsConfig,
}

impl RemoteInvokeStreamClient {
    /// Issue one call using the factory's default remote-methods configuration.
    pub fn invoke(&self, req: RemoteValue, options: InvokeOptions) -> RemoteStream {
        self.invoke_with(req, options, self.defaults.clone())
    }

    /// Issue one call, overriding the factory defaults for just this call.
    pub fn invoke_with(&self, req: RemoteValue, options: InvokeOptions, config: RemoteMethodsConfig) -> RemoteStream {
        if !config.allow {
            return RemoteStream::ready_err(EventaError::ProtocolGuard(
                "remote methods disabled by configuration".to_string(),
            ));
        }
        let serialized = match serialize(&self.ctx, req, &config) {
            Ok(s) => s,
            Err(err) => return RemoteStream::ready_err(err),
        };
        let dispose = serialized.dispose;
        schedule_auto_dispose(&config, dispose.clone());

        let ctx = self.ctx.clone();
        let raw = self.inner.invoke(serialized.value, options);
        let mapped = raw.map(move |item| item.and_then(|v| deserialize(&ctx, v, &config))).boxed();

        RemoteStream {
            dispose: dispose.clone(),
            inner: Box::pin(DisposeOnEnd { inner: mapped, dispose }),
        }
    }
}

struct DisposeOnEnd<S> {
    inner: S,
    dispose: DisposeHandle,
}

impl<S: Stream + Unpin> Stream for DisposeOnEnd<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_next(cx);
        if matches!(poll, Poll::Ready(None)) {
            // Stream exhausted normally: no further response could ever
            // arrive at any stub this call's request registered.
            this.dispose.dispose();
        }
        poll
    }
}

/// A pending remote-methods call. Implements `Future` so it can be awaited
/// directly; [`RemoteCall::dispose`] frees this call's stub handlers
/// immediately, for fire-and-forget or midway-cancellation use, without
/// waiting for the call to settle.
pub struct RemoteCall {
    dispose: DisposeHandle,
    inner: BoxFuture<'static, Result<RemoteValue, EventaError>>,
}

impl RemoteCall {
    fn ready(result: Result<RemoteValue, EventaError>) -> Self {
        RemoteCall {
            dispose: DisposeHandle::new(),
            inner: Box::pin(async move { result }),
        }
    }

    /// Free this call's stub handlers now. Safe to call more than once, and
    /// safe to call again after the call has already settled (the second
    /// call is a no-op).
    pub fn dispose(&self) {
        self.dispose.dispose();
    }
}

impl Future for RemoteCall {
    type Output = Result<RemoteValue, EventaError>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.as_mut().poll(cx)
    }
}

/// A remote-methods-wrapped response stream. Implements `Stream`;
/// [`RemoteStream::dispose`] frees this call's stub handlers immediately.
pub struct RemoteStream {
    dispose: DisposeHandle,
    inner: BoxStream<'static, Result<RemoteValue, EventaError>>,
}

impl RemoteStream {
    fn ready_err(err: EventaError) -> Self {
        RemoteStream {
            dispose: DisposeHandle::new(),
            inner: futures::stream::once(async move { Err(err) }).boxed(),
        }
    }

    /// Free this call's stub handlers now, even if the stream has not ended.
    pub fn dispose(&self) {
        self.dispose.dispose();
    }
}

impl Stream for RemoteStream {
    type Item = Result<RemoteValue, EventaError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Context;
    use crate::invoke::InputReceiver;
    use crate::matcher::Match;

    #[test]
    fn prototype_style_keys_round_trip_as_plain_data() {
        let ctx = Context::new();
        let config = RemoteMethodsConfig::default();
        let mut payload = serde_json::Map::new();
        let mut nested = serde_json::Map::new();
        nested.insert("test".to_string(), Value::String("value".into()));
        payload.insert("__proto__".to_string(), Value::Object(nested));
        let value = Value::Object(payload);

        let remote = deserialize(&ctx, value.clone(), &config).unwrap();
        let back = serialize(&ctx, remote, &config).unwrap();
        assert_eq!(back.value, value);
    }

    #[tokio::test]
    async fn function_values_round_trip_through_stub_invoke() {
        let ctx = Context::new();
        let config = RemoteMethodsConfig::default();

        let f: RemoteFn = Arc::new(|arg: Value| {
            Box::pin(async move {
                let n = arg.as_i64().unwrap_or(0);
                Ok(Value::from(n + 1))
            })
        });
        let payload = RemoteValue::Object(vec![("onTick".to_string(), RemoteValue::function(f))]);

        let serialized = serialize(&ctx, payload, &config).unwrap();
        let rehydrated = deserialize(&ctx, serialized.value, &config).unwrap();

        let entries = match rehydrated {
            RemoteValue::Object(e) => e,
            _ => panic!("expected object"),
        };
        let (_, stub) = &entries[0];
        let stub_fn = match stub {
            RemoteValue::Function(f) => f.clone(),
            _ => panic!("expected function stub"),
        };
        let result = stub_fn(Value::from(41)).await.unwrap();
        assert_eq!(result, Value::from(42));
        serialized.dispose.dispose();
    }

    #[test]
    fn depth_cap_rejects_deeply_nested_payloads() {
        let ctx = Context::new();
        let config = RemoteMethodsConfig {
            max_depth: 2,
            ..Default::default()
        };
        let mut value = Value::String("leaf".into());
        for _ in 0..5 {
            value = Value::Array(vec![value]);
        }
        let result = deserialize(&ctx, value, &config);
        assert!(matches!(result, Err(EventaError::ProtocolGuard(_))));
    }

    #[test]
    fn function_count_cap_rejects_excess_stubs() {
        let ctx = Context::new();
        let config = RemoteMethodsConfig {
            max_functions: 1,
            ..Default::default()
        };
        let marker = stub_marker("rpc-fn-a");
        let other = stub_marker("rpc-fn-b");
        let value = Value::Array(vec![marker, other]);
        let result = deserialize(&ctx, value, &config);
        assert!(matches!(result, Err(EventaError::ProtocolGuard(_))));
    }

    #[test]
    fn disallowed_tag_prefix_is_ignored_by_default() {
        let ctx = Context::new();
        let config = RemoteMethodsConfig::default();
        let marker = stub_marker("not-the-configured-prefix");
        let result = deserialize(&ctx, marker.clone(), &config).unwrap();
        match result {
            RemoteValue::Value(v) => assert_eq!(v, marker),
            _ => panic!("expected the marker left as plain data"),
        }
    }

    #[tokio::test]
    async fn remote_methods_client_disposes_stub_handlers_once_the_call_settles() {
        let ctx = Context::new();
        let family = InvokeFamily::new("remote-echo");
        let _disposer = define_invoke_handler::<Value, Value>(
            &ctx,
            family.clone(),
            Arc::new(|input: InputReceiver<Value>, _opts| {
                Box::pin(async move {
                    let mut input = input;
                    let arg = input.next().await.unwrap().unwrap();
                    Ok(HandlerResponse::plain(arg))
                })
            }),
        );

        let remote = with_remote_methods(&ctx, RemoteMethodsConfig::default());
        let client = remote.define_invoke(family);

        let f: RemoteFn = Arc::new(|arg: Value| Box::pin(async move { Ok(arg) }));
        let payload = RemoteValue::Object(vec![("onTick".to_string(), RemoteValue::function(f))]);

        let baseline = ctx.listener_count(Match::wildcard());
        let call = client.invoke(payload, InvokeOptions::none());
        assert!(ctx.listener_count(Match::wildcard()) > baseline);

        let result = call.await.unwrap();
        assert!(matches!(result, RemoteValue::Object(_)));
        assert_eq!(ctx.listener_count(Match::wildcard()), baseline);
    }

    #[tokio::test]
    async fn remote_methods_allow_false_rejects_without_registering_anything() {
        let ctx = Context::new();
        let family = InvokeFamily::new("remote-disabled");
        let remote = with_remote_methods(
            &ctx,
            RemoteMethodsConfig {
                allow: false,
                ..Default::default()
            },
        );
        let client = remote.define_invoke(family);

        let f: RemoteFn = Arc::new(|arg: Value| Box::pin(async move { Ok(arg) }));
        let payload = RemoteValue::Object(vec![("onTick".to_string(), RemoteValue::function(f))]);

        let baseline = ctx.listener_count(Match::wildcard());
        let result = client.invoke(payload, InvokeOptions::none()).await;
        assert!(matches!(result, Err(EventaError::ProtocolGuard(_))));
        assert_eq!(ctx.listener_count(Match::wildcard()), baseline);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_methods_auto_dispose_tears_down_even_if_the_call_never_settles() {
        let ctx = Context::new();
        let family = InvokeFamily::new("remote-hangs-forever");
        let remote = with_remote_methods(
            &ctx,
            RemoteMethodsConfig {
                auto_dispose_ms: Some(50),
                ..Default::default()
            },
        );
        let client = remote.define_invoke(family);

        let f: RemoteFn = Arc::new(|arg: Value| Box::pin(async move { Ok(arg) }));
        let payload = RemoteValue::Object(vec![("onTick".to_string(), RemoteValue::function(f))]);

        let baseline = ctx.listener_count(Match::wildcard());
        let call = client.invoke(payload, InvokeOptions::none());
        assert!(ctx.listener_count(Match::wildcard()) > baseline);

        tokio::time::advance(std::time::Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(ctx.listener_count(Match::wildcard()), baseline);

        // Idempotent even though the auto-dispose timer already ran, and
        // even though the underlying call — no one ever answers
        // "remote-hangs-forever" — never settles.
        call.dispose();
    }
}
