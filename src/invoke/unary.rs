//! Unary invoke: one response per call, with an optional client-streaming
//! request body ("client streams a few chunks, gets one reply back").

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::bus::{Context, EmitOptions, ListenerFn};
use crate::error::EventaError;
use crate::invoke::cancellation::spawn_cancel_watcher;
use crate::invoke::family::{InvokeAbortBody, InvokeBody, InvokeEndBody, InvokeErrorBody, InvokeFamily};
use crate::invoke::options::{HandlerResponse, InvokeOptions};
use crate::invoke::request_body::RequestBody;
use crate::invoke::state::{InputReceiver, InvokeServerState};
use crate::matcher::Match;

/// The client half of a unary invoke method, bound to one [`InvokeFamily`].
///
/// Cheap to clone: a clone shares the same underlying `Context` and calls
/// the same family, so either copy can be used to issue further calls
/// (e.g. to invoke a rehydrated remote-methods stub more than once).
pub struct InvokeClient<Req, Res> {
    ctx: Context,
    family: InvokeFamily,
    _marker: std::marker::PhantomData<fn(Req) -> Res>,
}

impl<Req, Res> Clone for InvokeClient<Req, Res> {
    fn clone(&self) -> Self {
        InvokeClient {
            ctx: self.ctx.clone(),
            family: self.family.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

/// Bind a unary invoke client to `family` on `ctx`.
pub fn define_invoke<Req, Res>(ctx: &Context, family: InvokeFamily) -> InvokeClient<Req, Res>
where
    Req: Serialize + Send + 'static,
    Res: DeserializeOwned + Send + 'static,
{
    InvokeClient {
        ctx: ctx.clone(),
        family,
        _marker: std::marker::PhantomData,
    }
}

impl<Req, Res> InvokeClient<Req, Res>
where
    Req: Serialize + Send + 'static,
    Res: DeserializeOwned + Send + 'static,
{
    /// Issue one call and await its single response.
    ///
    /// `req` accepts either a plain value or a [`RequestBody::Stream`] of
    /// chunks; `options.cancel`, if tripped before or during the call,
    /// settles the call as [`EventaError::Aborted`] and emits `send-abort`.
    pub async fn invoke(
        &self,
        req: impl Into<RequestBody<Req>>,
        options: InvokeOptions,
    ) -> Result<Res, EventaError> {
        let req = req.into();
        let InvokeOptions { cancel, extra } = options;
        let invoke_id = crate::id::generate_invoke_id();

        if let Some(c) = &cancel {
            if c.is_cancelled() {
                self.emit_abort(&invoke_id, None);
                return Err(EventaError::aborted());
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel::<Result<Res, EventaError>>();
        let settle = Arc::new(Mutex::new(Some(tx)));

        let receive_desc = self.family.receive_for::<Res>(&invoke_id);
        let receive_err_desc = self.family.receive_error_for(&invoke_id);
        let receive_match: Match = (&receive_desc).into();
        let receive_err_match: Match = (&receive_err_desc).into();

        let cleanup = {
            let ctx = self.ctx.clone();
            let receive_match = receive_match.clone();
            let receive_err_match = receive_err_match.clone();
            move || {
                ctx.off(receive_match.clone(), None);
                ctx.off(receive_err_match.clone(), None);
            }
        };

        {
            let settle = settle.clone();
            let cleanup = cleanup.clone();
            let listener: ListenerFn = Arc::new(move |envelope, _opts| {
                let body: InvokeBody<Res> = match serde_json::from_value(envelope.body.clone()) {
                    Ok(b) => b,
                    Err(err) => {
                        tracing::error!(descriptor = envelope.id, error = %err, "malformed receive body");
                        if let Some(tx) = settle.lock().unwrap().take() {
                            let _ = tx.send(Err(EventaError::BodyMismatch {
                                descriptor_id: envelope.id.clone(),
                                detail: err.to_string(),
                            }));
                        }
                        cleanup();
                        return;
                    }
                };
                if let Some(tx) = settle.lock().unwrap().take() {
                    let _ = tx.send(Ok(body.content));
                }
                cleanup();
            });
            self.ctx.on(receive_match.clone(), listener);
        }
        {
            let settle = settle.clone();
            let cleanup = cleanup.clone();
            let listener: ListenerFn = Arc::new(move |envelope, _opts| {
                let body: InvokeErrorBody = match serde_json::from_value(envelope.body.clone()) {
                    Ok(b) => b,
                    Err(err) => {
                        tracing::error!(descriptor = envelope.id, error = %err, "malformed receive-error body");
                        if let Some(tx) = settle.lock().unwrap().take() {
                            let _ = tx.send(Err(EventaError::BodyMismatch {
                                descriptor_id: envelope.id.clone(),
                                detail: err.to_string(),
                            }));
                        }
                        cleanup();
                        return;
                    }
                };
                if let Some(tx) = settle.lock().unwrap().take() {
                    let _ = tx.send(Err(EventaError::Handler(body.error)));
                }
                cleanup();
            });
            self.ctx.on(receive_err_match.clone(), listener);
        }

        let fatal_id = {
            let settle = settle.clone();
            let cleanup = cleanup.clone();
            self.ctx.register_fatal_listener(Arc::new(move |value: Value| {
                if let Some(tx) = settle.lock().unwrap().take() {
                    let _ = tx.send(Err(EventaError::Fatal(value)));
                }
                cleanup();
            }))
        };

        let cancel_watch = cancel.clone().map(|c| {
            let ctx = self.ctx.clone();
            let family = self.family.clone();
            let invoke_id = invoke_id.clone();
            let settle = settle.clone();
            let cleanup = cleanup.clone();
            spawn_cancel_watcher(c, move || {
                ctx.emit(
                    &family.send_abort(),
                    InvokeAbortBody {
                        invoke_id: invoke_id.clone(),
                        reason: None,
                    },
                    None,
                );
                if let Some(tx) = settle.lock().unwrap().take() {
                    let _ = tx.send(Err(EventaError::aborted()));
                }
                cleanup();
            })
        });

        self.emit_request(req, &invoke_id, cancel.clone(), extra, settle.clone(), cleanup.clone());

        let result = rx.await.unwrap_or_else(|_| Err(EventaError::aborted()));

        if let Some(handle) = cancel_watch {
            handle.abort();
        }
        self.ctx.unregister_fatal_listener(fatal_id);
        cleanup();

        result
    }

    fn emit_abort(&self, invoke_id: &str, reason: Option<String>) {
        self.ctx.emit(
            &self.family.send_abort(),
            InvokeAbortBody {
                invoke_id: invoke_id.to_string(),
                reason,
            },
            None,
        );
    }

    /// `settle`/`cleanup` let a client-streaming request's producer failure
    /// settle the call locally (as [`EventaError::RequestProducer`]) in
    /// addition to notifying the peer via `send-error`: once the producer
    /// has failed, no further chunks or a `send-stream-end` will ever
    /// arrive, so nothing else would otherwise settle this call.
    fn emit_request<F>(
        &self,
        req: RequestBody<Req>,
        invoke_id: &str,
        cancel: Option<tokio_util::sync::CancellationToken>,
        extra: Option<Value>,
        settle: Arc<Mutex<Option<tokio::sync::oneshot::Sender<Result<Res, EventaError>>>>>,
        cleanup: F,
    ) where
        F: Fn() + Send + Sync + 'static,
    {
        match req {
            RequestBody::Unary(value) => {
                self.ctx.emit(
                    &self.family.send::<Req>(),
                    InvokeBody::unary(invoke_id.to_string(), value),
                    extra.map(|e| EmitOptions { extra: Some(e) }),
                );
            }
            RequestBody::Stream(mut stream) => {
                let ctx = self.ctx.clone();
                let family = self.family.clone();
                let invoke_id = invoke_id.to_string();
                tokio::spawn(async move {
                    loop {
                        if let Some(c) = &cancel {
                            if c.is_cancelled() {
                                return;
                            }
                        }
                        match stream.next().await {
                            Some(Ok(chunk)) => {
                                ctx.emit(
                                    &family.send::<Req>(),
                                    InvokeBody::stream_chunk(invoke_id.clone(), chunk),
                                    extra.clone().map(|e| EmitOptions { extra: Some(e) }),
                                );
                            }
                            Some(Err(err)) => {
                                let aborted = cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false);
                                if !aborted {
                                    let error_value = Value::String(err.to_string());
                                    ctx.emit(
                                        &family.send_error(),
                                        InvokeErrorBody {
                                            invoke_id: invoke_id.clone(),
                                            error: error_value.clone(),
                                        },
                                        None,
                                    );
                                    if let Some(tx) = settle.lock().unwrap().take() {
                                        let _ = tx.send(Err(EventaError::RequestProducer(error_value)));
                                    }
                                    cleanup();
                                }
                                return;
                            }
                            None => {
                                let aborted = cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false);
                                if !aborted {
                                    ctx.emit(
                                        &family.send_stream_end(),
                                        InvokeEndBody {
                                            invoke_id: invoke_id.clone(),
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
    }
}

/// A server-side unary handler: consumes the request as a stream (a single
/// chunk for a plain call, several for a client-streaming one) and resolves
/// to one response or one error value.
pub type BoxUnaryHandler<Req, Res> = Arc<
    dyn Fn(InputReceiver<Req>, InvokeOptions) -> BoxFuture<'static, Result<HandlerResponse<Res>, Value>>
        + Send
        + Sync,
>;

/// Handle returned by [`define_invoke_handler`]; removes the handler's three
/// listeners when disposed. Not disposed automatically on drop, so binding
/// the result to `_` does not immediately tear the handler down.
pub struct InvokeHandlerDisposer {
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

impl InvokeHandlerDisposer {
    /// Remove this handler's listeners, and only this handler's — a
    /// different handler registered against the same family is untouched.
    /// In-flight calls already dispatched to the user handler still run to
    /// completion.
    pub fn dispose(self) {
        self.ctx.off(self.send_match, Some(&self.send_listener));
        self.ctx.off(self.send_end_match, Some(&self.send_end_listener));
        self.ctx.off(self.send_abort_match, Some(&self.send_abort_listener));
        self.ctx.forget_handler_listeners(&self.cache_key, self.handler_ptr);
    }
}

/// Register a unary invoke handler against `family` on `ctx`.
///
/// Registering the same `handler` (by `Arc` identity) against the same
/// family twice is a no-op: the three listener closures built to wire it up
/// are memoized per handler, so the bus's own `Arc`-identity dedup in
/// `Context::on` recognizes the repeat registration.
pub fn define_invoke_handler<Req, Res>(
    ctx: &Context,
    family: InvokeFamily,
    handler: BoxUnaryHandler<Req, Res>,
) -> InvokeHandlerDisposer
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    let send_desc = family.send::<Req>();
    let send_end_desc = family.send_stream_end();
    let send_abort_desc = family.send_abort();

    let cache_key = format!("unary:{}", send_desc.id());
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
                        run_unary_handler(ctx.clone(), family.clone(), state.clone(), handler.clone(), body.invoke_id, rx, InvokeOptions::none());
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
                        run_unary_handler(ctx.clone(), family.clone(), state.clone(), handler.clone(), body.invoke_id, rx, InvokeOptions::none());
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
                    // `error_input` returning `Some` means nothing had started
                    // consuming this invocation's input yet; a handler that had
                    // already started observes the abort at its next stream read
                    // instead. A `send`/`send-stream-end` arriving after this point
                    // for the same invokeId would spawn a second, orphaned handler
                    // run — an accepted, out-of-order edge case with no listener
                    // left to observe its result.
                    if let Some(rx) = state.error_input(&body.invoke_id, body.reason.clone()) {
                        run_unary_handler(ctx.clone(), family.clone(), state.clone(), handler.clone(), body.invoke_id.clone(), rx, InvokeOptions::none());
                    }
                })
            };

            (send_listener, send_end_listener, send_abort_listener)
        });

    ctx.on(&send_desc, send_listener.clone());
    ctx.on(&send_end_desc, send_end_listener.clone());
    ctx.on(&send_abort_desc, send_abort_listener.clone());

    InvokeHandlerDisposer {
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

fn run_unary_handler<Req, Res>(
    ctx: Context,
    family: InvokeFamily,
    state: Arc<InvokeServerState<Req>>,
    handler: BoxUnaryHandler<Req, Res>,
    invoke_id: String,
    input: InputReceiver<Req>,
    options: InvokeOptions,
) where
    Req: Send + 'static,
    Res: Serialize + Send + 'static,
{
    tokio::spawn(async move {
        match handler(input, options).await {
            Ok(resp) => {
                ctx.emit(
                    &family.receive_for::<Res>(&invoke_id),
                    InvokeBody::unary(invoke_id.clone(), resp.response),
                    resp.extra.map(|e| EmitOptions { extra: Some(e) }),
                );
            }
            Err(error) => {
                ctx.emit(
                    &family.receive_error_for(&invoke_id),
                    InvokeErrorBody {
                        invoke_id: invoke_id.clone(),
                        error,
                    },
                    None,
                );
            }
        }
        state.clear(&invoke_id);
    });
}
