//! Streaming invoke: a server-produced stream of responses per call, with
//! the same optional client-streaming request body unary invoke accepts.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bus::{Context, EmitOptions, ListenerFn};
use crate::error::EventaError;
use crate::invoke::family::{InvokeAbortBody, InvokeBody, InvokeEndBody, InvokeErrorBody, InvokeFamily};
use crate::invoke::options::InvokeOptions;
use crate::invoke::request_body::RequestBody;
use crate::invoke::state::{InputReceiver, InvokeServerState};
use crate::matcher::Match;

/// The client half of a streaming invoke method, bound to one
/// [`InvokeFamily`].
pub struct InvokeStreamClient<Req, Res> {
    ctx: Context,
    family: InvokeFamily,
    _marker: std::marker::PhantomData<fn(Req) -> Res>,
}

/// Bind a streaming invoke client to `family` on `ctx`.
pub fn define_stream_invoke<Req, Res>(ctx: &Context, family: InvokeFamily) -> InvokeStreamClient<Req, Res>
where
    Req: Serialize + Send + 'static,
    Res: DeserializeOwned + Send + 'static,
{
    InvokeStreamClient {
        ctx: ctx.clone(),
        family,
        _marker: std::marker::PhantomData,
    }
}

struct StreamGuard {
    ctx: Context,
    family: InvokeFamily,
    invoke_id: String,
    receive_match: Match,
    receive_err_match: Match,
    receive_end_match: Match,
    fatal_id: u64,
    settled: Arc<AtomicBool>,
}

impl StreamGuard {
    fn cleanup_listeners(&self) {
        self.ctx.off(self.receive_match.clone(), None);
        self.ctx.off(self.receive_err_match.clone(), None);
        self.ctx.off(self.receive_end_match.clone(), None);
        self.ctx.unregister_fatal_listener(self.fatal_id);
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.cleanup_listeners();
        // `compare_exchange` so a racing terminal-event listener and this
        // drop cannot both emit `send-abort`.
        if self
            .settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.ctx.emit(
                &self.family.send_abort(),
                InvokeAbortBody {
                    invoke_id: self.invoke_id.clone(),
                    reason: Some("stream dropped by consumer".into()),
                },
                None,
            );
        }
    }
}

struct GuardedInvokeStream<Res> {
    inner: tokio_stream::wrappers::UnboundedReceiverStream<Result<Res, EventaError>>,
    _guard: StreamGuard,
}

impl<Res> Stream for GuardedInvokeStream<Res> {
    type Item = Result<Res, EventaError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_next(cx);
        if matches!(poll, Poll::Ready(None)) {
            this._guard.settled.store(true, Ordering::SeqCst);
        }
        poll
    }
}

impl<Req, Res> InvokeStreamClient<Req, Res>
where
    Req: Serialize + Send + 'static,
    Res: DeserializeOwned + Send + 'static,
{
    /// Issue one call and return a lazily-pulled stream of its responses.
    ///
    /// The request side (a plain `send`, or the client-streaming pump) is
    /// emitted eagerly as soon as this method returns, not deferred to the
    /// returned stream's first poll; only the receive side is pull-based —
    /// nothing is decoded off the bus until the consumer actually polls for
    /// the next item. Dropping the stream before it ends, or tripping
    /// `options.cancel`, emits `send-abort` exactly once. If
    /// `options.cancel` is already tripped when this method is called,
    /// `send-abort` is emitted immediately and no `send` goes out at all.
    pub fn invoke(
        &self,
        req: impl Into<RequestBody<Req>>,
        options: InvokeOptions,
    ) -> BoxStream<'static, Result<Res, EventaError>> {
        let req = req.into();
        let InvokeOptions { cancel, extra } = options;
        let invoke_id = crate::id::generate_invoke_id();

        if let Some(c) = &cancel {
            if c.is_cancelled() {
                self.ctx.emit(
                    &self.family.send_abort(),
                    InvokeAbortBody {
                        invoke_id: invoke_id.clone(),
                        reason: None,
                    },
                    None,
                );
                return futures::stream::once(async { Err(EventaError::aborted()) }).boxed();
            }
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Res, EventaError>>();
        let settled = Arc::new(AtomicBool::new(false));

        let receive_desc = self.family.receive_for::<Res>(&invoke_id);
        let receive_err_desc = self.family.receive_error_for(&invoke_id);
        let receive_end_desc = self.family.receive_stream_end_for(&invoke_id);
        let receive_match: Match = (&receive_desc).into();
        let receive_err_match: Match = (&receive_err_desc).into();
        let receive_end_match: Match = (&receive_end_desc).into();

        {
            let tx = tx.clone();
            let listener: ListenerFn = Arc::new(move |envelope, _opts| {
                let body: InvokeBody<Res> = match serde_json::from_value(envelope.body.clone()) {
                    Ok(b) => b,
                    Err(err) => {
                        tracing::error!(descriptor = envelope.id, error = %err, "malformed receive body");
                        let _ = tx.send(Err(EventaError::BodyMismatch {
                            descriptor_id: envelope.id.clone(),
                            detail: err.to_string(),
                        }));
                        return;
                    }
                };
                let _ = tx.send(Ok(body.content));
            });
            self.ctx.on(receive_match.clone(), listener);
        }
        {
            let tx = tx.clone();
            let settled = settled.clone();
            let listener: ListenerFn = Arc::new(move |envelope, _opts| {
                let body: InvokeErrorBody = match serde_json::from_value(envelope.body.clone()) {
                    Ok(b) => b,
                    Err(err) => {
                        tracing::error!(descriptor = envelope.id, error = %err, "malformed receive-error body");
                        settled.store(true, Ordering::SeqCst);
                        let _ = tx.send(Err(EventaError::BodyMismatch {
                            descriptor_id: envelope.id.clone(),
                            detail: err.to_string(),
                        }));
                        return;
                    }
                };
                settled.store(true, Ordering::SeqCst);
                let _ = tx.send(Err(EventaError::Handler(body.error)));
            });
            self.ctx.on(receive_err_match.clone(), listener);
        }
        {
            let settled = settled.clone();
            let listener: ListenerFn = Arc::new(move |_envelope, _opts| {
                settled.store(true, Ordering::SeqCst);
                // drop tx's remaining clone when this closure is dropped; the
                // channel still has the original `tx` below kept alive by
                // the guard's enclosing scope until the call settles.
            });
            self.ctx.on(receive_end_match.clone(), listener);
        }

        let fatal_id = {
            let tx = tx.clone();
            let settled = settled.clone();
            self.ctx.register_fatal_listener(Arc::new(move |value: Value| {
                settled.store(true, Ordering::SeqCst);
                let _ = tx.send(Err(EventaError::Fatal(value)));
            }))
        };

        if let Some(c) = cancel.clone() {
            let ctx = self.ctx.clone();
            let family = self.family.clone();
            let invoke_id2 = invoke_id.clone();
            let tx = tx.clone();
            let settled = settled.clone();
            tokio::spawn(async move {
                c.cancelled().await;
                if settled
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    ctx.emit(
                        &family.send_abort(),
                        InvokeAbortBody {
                            invoke_id: invoke_id2,
                            reason: None,
                        },
                        None,
                    );
                    let _ = tx.send(Err(EventaError::aborted()));
                }
            });
        }

        // The request side mirrors the unary client's: a plain value emits
        // one `send`; a stream of chunks is pumped until it ends or errors.
        match req {
            RequestBody::Unary(value) => {
                self.ctx.emit(
                    &self.family.send::<Req>(),
                    InvokeBody::unary(invoke_id.clone(), value),
                    extra.map(|e| EmitOptions { extra: Some(e) }),
                );
            }
            RequestBody::Stream(mut stream) => {
                let ctx = self.ctx.clone();
                let family = self.family.clone();
                let invoke_id_p = invoke_id.clone();
                let cancel_p = cancel.clone();
                let tx_p = tx.clone();
                let settled_p = settled.clone();
                tokio::spawn(async move {
                    loop {
                        if let Some(c) = &cancel_p {
                            if c.is_cancelled() {
                                return;
                            }
                        }
                        match stream.next().await {
                            Some(Ok(chunk)) => {
                                ctx.emit(
                                    &family.send::<Req>(),
                                    InvokeBody::stream_chunk(invoke_id_p.clone(), chunk),
                                    extra.clone().map(|e| EmitOptions { extra: Some(e) }),
                                );
                            }
                            Some(Err(err)) => {
                                if !cancel_p.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
                                    let error_value = Value::String(err.to_string());
                                    ctx.emit(
                                        &family.send_error(),
                                        InvokeErrorBody {
                                            invoke_id: invoke_id_p.clone(),
                                            error: error_value.clone(),
                                        },
                                        None,
                                    );
                                    // Nothing else will ever settle this call:
                                    // no further chunks or a stream-end can
                                    // follow a producer failure.
                                    if settled_p
                                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                                        .is_ok()
                                    {
                                        let _ = tx_p.send(Err(EventaError::RequestProducer(error_value)));
                                    }
                                }
                                return;
                            }
                            None => {
                                if !cancel_p.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
                                    ctx.emit(
                                        &family.send_stream_end(),
                                        InvokeEndBody {
                                            invoke_id: invoke_id_p.clone(),
                                        },
                                        None,
                                    );
                                }
                                return;
                            }
                        }
                    }
                });
            }
        }

        let guard = StreamGuard {
            ctx: self.ctx.clone(),
            family: self.family.clone(),
            invoke_id,
            receive_match,
            receive_err_match,
            receive_end_match,
            fatal_id,
            settled,
        };

        Box::pin(GuardedInvokeStream {
            inner: tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
            _guard: guard,
        })
    }
}

/// A server-side streaming handler: consumes the request as a stream, same
/// as the unary handler, and produces a stream of responses instead of one.
pub type BoxStreamHandler<Req, Res> = Arc<
    dyn Fn(InputReceiver<Req>, InvokeOptions) -> BoxFuture<'static, BoxStream<'static, Result<Res, Value>>>
        + Send
        + Sync,
>;

/// Handle returned by [`define_stream_invoke_handler`].
pub struct StreamHandlerDisposer {
    ctx: Context,
    send_match: Match,
    send_end_match: Match,
    send_abort_match: Match,
    send_listener: ListenerFn,
    send_end_listener: ListenerFn,
    send_abort_listener: ListenerFn,
    cache_key: String,
    handler_ptr: usize,
}

impl StreamHandlerDisposer {
    /// Remove this handler's listeners, and only this handler's; producers
    /// already running continue to completion (or until their token trips).
    pub fn dispose(self) {
        self.ctx.off(self.send_match, Some(&self.send_listener));
        self.ctx.off(self.send_end_match, Some(&self.send_end_listener));
        self.ctx.off(self.send_abort_match, Some(&self.send_abort_listener));
        self.ctx.forget_handler_listeners(&self.cache_key, self.handler_ptr);
    }
}

/// Register a streaming invoke handler against `family` on `ctx`.
///
/// Registering the same `handler` (by `Arc` identity) against the same
/// family twice is a no-op, for the same reason as
/// [`crate::invoke::unary::define_invoke_handler`].
pub fn define_stream_invoke_handler<Req, Res>(
    ctx: &Context,
    family: InvokeFamily,
    handler: BoxStreamHandler<Req, Res>,
) -> StreamHandlerDisposer
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    let send_desc = family.send::<Req>();
    let send_end_desc = family.send_stream_end();
    let send_abort_desc = family.send_abort();

    let cache_key = format!("stream:{}", send_desc.id());
    let handler_ptr = Arc::as_ptr(&handler) as *const () as usize;

    let (send_listener, send_end_listener, send_abort_listener) =
        ctx.handler_listeners(&cache_key, handler_ptr, || {
            let state: Arc<InvokeServerState<Req>> = Arc::new(InvokeServerState::new());

            let send_listener: ListenerFn = {
                let ctx = ctx.clone();
                let family = family.clone();
                let state = state.clone();
                let handler = handler.clone();
                Arc::new(move |envelope, _opts| {
                    let body: InvokeBody<Req> = match serde_json::from_value(envelope.body.clone()) {
                        Ok(b) => b,
                        Err(err) => {
                            tracing::error!(descriptor = envelope.id, error = %err, "malformed send body");
                            return;
                        }
                    };
                    let is_stream = body.is_req_stream.unwrap_or(false);
                    if let Some(rx) = state.push_chunk(&body.invoke_id, body.content) {
                        if !is_stream {
                            state.close(&body.invoke_id);
                        }
                        start_producer(ctx.clone(), family.clone(), state.clone(), handler.clone(), body.invoke_id, rx);
                    }
                })
            };

            let send_end_listener: ListenerFn = {
                let ctx = ctx.clone();
                let family = family.clone();
                let state = state.clone();
                let handler = handler.clone();
                Arc::new(move |envelope, _opts| {
                    let body: InvokeEndBody = match serde_json::from_value(envelope.body.clone()) {
                        Ok(b) => b,
                        Err(err) => {
                            tracing::error!(descriptor = envelope.id, error = %err, "malformed send-stream-end body");
                            return;
                        }
                    };
                    if let Some(rx) = state.close(&body.invoke_id) {
                        start_producer(ctx.clone(), family.clone(), state.clone(), handler.clone(), body.invoke_id, rx);
                    }
                })
            };

            let send_abort_listener: ListenerFn = {
                let ctx = ctx.clone();
                let family = family.clone();
                let state = state.clone();
                let handler = handler.clone();
                Arc::new(move |envelope, _opts| {
                    let body: InvokeAbortBody = match serde_json::from_value(envelope.body.clone()) {
                        Ok(b) => b,
                        Err(err) => {
                            tracing::error!(descriptor = envelope.id, error = %err, "malformed send-abort body");
                            return;
                        }
                    };
                    match state.record_abort(&body.invoke_id, body.reason.clone()) {
                        Some(token) => {
                            // A producer is already running (or has already been
                            // scheduled to start). Trip its token next turn and
                            // separately interrupt its input stream if one is still
                            // open; if the input side had already closed, the
                            // synthesized stream `error_input` hands back here has
                            // no reader and is simply dropped.
                            tokio::spawn(async move {
                                tokio::task::yield_now().await;
                                token.cancel();
                            });
                            let _ = state.error_input(&body.invoke_id, body.reason.clone());
                        }
                        None => {
                            // Nothing had started consuming input yet, so no
                            // producer has run either; spawn it now against a token
                            // that is already about to trip, per the eager-start
                            // interpretation documented alongside the unary
                            // handler's abort listener.
                            if let Some(rx) = state.error_input(&body.invoke_id, body.reason.clone()) {
                                let token = state.token_for(&body.invoke_id);
                                token.cancel();
                                start_producer_with_options(
                                    ctx.clone(),
                                    family.clone(),
                                    state.clone(),
                                    handler.clone(),
                                    body.invoke_id.clone(),
                                    rx,
                                    InvokeOptions::none().with_cancel(token),
                                );
                            }
                        }
                    }
                })
            };

            (send_listener, send_end_listener, send_abort_listener)
        });

    ctx.on(&send_desc, send_listener.clone());
    ctx.on(&send_end_desc, send_end_listener.clone());
    ctx.on(&send_abort_desc, send_abort_listener.clone());

    StreamHandlerDisposer {
        ctx: ctx.clone(),
        send_match: (&send_desc).into(),
        send_end_match: (&send_end_desc).into(),
        send_abort_match: (&send_abort_desc).into(),
        send_listener,
        send_end_listener,
        send_abort_listener,
        cache_key,
        handler_ptr,
    }
}

fn start_producer<Req, Res>(
    ctx: Context,
    family: InvokeFamily,
    state: Arc<InvokeServerState<Req>>,
    handler: BoxStreamHandler<Req, Res>,
    invoke_id: String,
    input: InputReceiver<Req>,
) where
    Req: Send + 'static,
    Res: Serialize + Send + 'static,
{
    let token = state.token_for(&invoke_id);
    if let Some(deferred) = state.take_deferred_abort(&invoke_id) {
        token.cancel();
        let _ = deferred;
    }
    start_producer_with_options(ctx, family, state, handler, invoke_id, input, InvokeOptions::none().with_cancel(token));
}

fn start_producer_with_options<Req, Res>(
    ctx: Context,
    family: InvokeFamily,
    state: Arc<InvokeServerState<Req>>,
    handler: BoxStreamHandler<Req, Res>,
    invoke_id: String,
    input: InputReceiver<Req>,
    options: InvokeOptions,
) where
    Req: Send + 'static,
    Res: Serialize + Send + 'static,
{
    tokio::spawn(async move {
        let mut output = handler(input, options).await;
        loop {
            match output.next().await {
                Some(Ok(item)) => {
                    ctx.emit(
                        &family.receive_for::<Res>(&invoke_id),
                        InvokeBody::unary(invoke_id.clone(), item),
                        None,
                    );
                }
                Some(Err(error)) => {
                    ctx.emit(
                        &family.receive_error_for(&invoke_id),
                        InvokeErrorBody {
                            invoke_id: invoke_id.clone(),
                            error,
                        },
                        None,
                    );
                    break;
                }
                None => {
                    ctx.emit(
                        &family.receive_stream_end_for(&invoke_id),
                        InvokeEndBody {
                            invoke_id: invoke_id.clone(),
                        },
                        None,
                    );
                    break;
                }
            }
        }
        state.clear(&invoke_id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Context;

    fn counting_handler(n: u32) -> BoxStreamHandler<(), u32> {
        Arc::new(move |_input: InputReceiver<()>, options: InvokeOptions| {
            Box::pin(async move {
                let cancel = options.cancel;
                futures::stream::iter((0..n).map(Ok))
                    .take_while(move |_| {
                        let cancelled = cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false);
                        async move { !cancelled }
                    })
                    .boxed()
            })
        })
    }

    #[tokio::test]
    async fn streamed_responses_arrive_in_order() {
        let ctx = Context::new();
        let family = InvokeFamily::new("count-to-three");
        let _disposer = define_stream_invoke_handler(&ctx, family.clone(), counting_handler(3));
        let client: InvokeStreamClient<(), u32> = define_stream_invoke(&ctx, family);
        let items: Vec<_> = client.invoke((), InvokeOptions::none()).collect().await;
        let items: Vec<u32> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(items, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn dropping_the_stream_early_emits_abort() {
        let ctx = Context::new();
        let family = InvokeFamily::new("count-forever");
        let saw_abort = Arc::new(AtomicBool::new(false));
        {
            let saw_abort = saw_abort.clone();
            ctx.on(
                Match::invoke_role(crate::descriptor::InvokeRole::SendAbort),
                Arc::new(move |_e, _o| {
                    saw_abort.store(true, Ordering::SeqCst);
                }),
            );
        }
        let _disposer = define_stream_invoke_handler(&ctx, family.clone(), counting_handler(1_000_000));
        let client: InvokeStreamClient<(), u32> = define_stream_invoke(&ctx, family);
        {
            let mut stream = client.invoke((), InvokeOptions::none());
            let _ = stream.next().await;
        }
        tokio::task::yield_now().await;
        assert!(saw_abort.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn registering_the_same_handler_twice_is_a_no_op() {
        let ctx = Context::new();
        let family = InvokeFamily::new("dup-stream-handler");
        let handler = counting_handler(3);
        let first = define_stream_invoke_handler(&ctx, family.clone(), handler.clone());
        let _second = define_stream_invoke_handler(&ctx, family.clone(), handler);
        assert_eq!(ctx.listener_count(Match::from(&family.send::<()>())), 1);

        first.dispose();
        assert_eq!(ctx.listener_count(Match::from(&family.send::<()>())), 0);
    }

    #[tokio::test]
    async fn cancel_token_settles_the_stream_with_aborted() {
        let ctx = Context::new();
        let family = InvokeFamily::new("cancellable-count");
        let _disposer = define_stream_invoke_handler(&ctx, family.clone(), counting_handler(1_000_000));
        let client: InvokeStreamClient<(), u32> = define_stream_invoke(&ctx, family);
        let cancel = CancellationToken::new();
        let mut stream = client.invoke((), InvokeOptions::none().with_cancel(cancel.clone()));
        cancel.cancel();
        let mut saw_abort = false;
        while let Some(item) = stream.next().await {
            if let Err(e) = item {
                assert!(e.is_aborted());
                saw_abort = true;
                break;
            }
        }
        assert!(saw_abort);
    }
}
