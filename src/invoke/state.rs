//! Per-handler server-side state: the streaming-input controller table, the
//! cooperative cancellation-token table, and the deferred-abort-reason
//! table a single `defineInvokeHandler`/`defineStreamInvokeHandler`
//! registration owns across all of the invocations it serves.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EventaError;

/// The consumer side of a client-streaming request's input, handed to user
/// handlers as an `impl Stream<Item = Result<Req, EventaError>>`.
pub type InputReceiver<Req> = tokio_stream::wrappers::UnboundedReceiverStream<Result<Req, EventaError>>;

struct InputController<Req> {
    sender: mpsc::UnboundedSender<Result<Req, EventaError>>,
}

/// Owns the mutable state a handler registration needs to correctly
/// implement client-streaming input assembly and cooperative cancellation,
/// keyed by `invokeId`.
pub(crate) struct InvokeServerState<Req> {
    inputs: DashMap<String, InputController<Req>>,
    tokens: DashMap<String, CancellationToken>,
    deferred_abort_reasons: DashMap<String, Option<String>>,
}

impl<Req> Default for InvokeServerState<Req> {
    fn default() -> Self {
        InvokeServerState {
            inputs: DashMap::new(),
            tokens: DashMap::new(),
            deferred_abort_reasons: DashMap::new(),
        }
    }
}

impl<Req: Send + 'static> InvokeServerState<Req> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Push one chunk onto `invoke_id`'s input stream, creating the
    /// controller (and the stream the handler will consume) if this is the
    /// first chunk seen for this invocation.
    ///
    /// Returns `Some(receiver)` the first time a controller is created, so
    /// the caller can spawn the handler against it; `None` on subsequent
    /// chunks, since the handler is already running.
    pub(crate) fn push_chunk(&self, invoke_id: &str, chunk: Req) -> Option<InputReceiver<Req>> {
        if let Some(controller) = self.inputs.get(invoke_id) {
            let _ = controller.sender.send(Ok(chunk));
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(chunk));
        self.inputs
            .insert(invoke_id.to_string(), InputController { sender: tx });
        Some(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }

    /// Close `invoke_id`'s input stream normally. If no controller exists
    /// yet (no chunks were observed before the stream-end arrived), an
    /// empty-then-closed stream is created and returned so a handler that
    /// has not started yet still observes "empty then end" rather than
    /// nothing at all.
    pub(crate) fn close(&self, invoke_id: &str) -> Option<InputReceiver<Req>> {
        if self.inputs.remove(invoke_id).is_some() {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        drop(tx);
        Some(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }

    /// Surface an abort as a single error item on `invoke_id`'s input
    /// stream and drop the controller. If no controller exists yet,
    /// synthesize an empty, already-errored stream so a handler that starts
    /// consuming after the fact still observes the abort (spec.md §9's
    /// interpretation (a) of the abort-before-handler-start design note).
    pub(crate) fn error_input(&self, invoke_id: &str, reason: Option<String>) -> Option<InputReceiver<Req>> {
        let err = match reason {
            Some(r) => EventaError::aborted_with(r),
            None => EventaError::aborted(),
        };
        if let Some((_, controller)) = self.inputs.remove(invoke_id) {
            let _ = controller.sender.send(Err(err));
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Err(err));
        drop(tx);
        Some(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }

    /// Install (or fetch the existing) cooperative cancellation token for
    /// `invoke_id`, to be handed to the handler before it starts executing.
    pub(crate) fn token_for(&self, invoke_id: &str) -> CancellationToken {
        self.tokens
            .entry(invoke_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Take (and clear) a deferred-abort reason recorded before this
    /// invocation's token existed, if any.
    pub(crate) fn take_deferred_abort(&self, invoke_id: &str) -> Option<Option<String>> {
        self.deferred_abort_reasons
            .remove(invoke_id)
            .map(|(_, reason)| reason)
    }

    /// Handle a `send-abort` for `invoke_id`: if a token already exists,
    /// return it so the caller can trip it (on the next scheduler turn);
    /// otherwise stash the reason for the handler to observe once it
    /// starts.
    pub(crate) fn record_abort(
        &self,
        invoke_id: &str,
        reason: Option<String>,
    ) -> Option<CancellationToken> {
        if let Some(token) = self.tokens.get(invoke_id) {
            Some(token.clone())
        } else {
            self.deferred_abort_reasons
                .insert(invoke_id.to_string(), reason);
            None
        }
    }

    /// Clear every entry for `invoke_id` on any termination path.
    pub(crate) fn clear(&self, invoke_id: &str) {
        self.inputs.remove(invoke_id);
        self.tokens.remove(invoke_id);
        self.deferred_abort_reasons.remove(invoke_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn first_chunk_creates_controller_later_chunks_reuse_it() {
        let state: InvokeServerState<u32> = InvokeServerState::new();
        let rx = state.push_chunk("id1", 1).expect("first chunk creates a receiver");
        assert!(state.push_chunk("id1", 2).is_none());
        state.close("id1");

        let items: Vec<_> = rx.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &1);
        assert_eq!(items[1].as_ref().unwrap(), &2);
    }

    #[tokio::test]
    async fn stream_end_with_no_chunks_yields_empty_stream() {
        let state: InvokeServerState<u32> = InvokeServerState::new();
        let rx = state.close("never-sent-a-chunk").expect("synthesized empty stream");
        let items: Vec<_> = rx.collect().await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn abort_before_any_chunk_yields_single_error() {
        let state: InvokeServerState<u32> = InvokeServerState::new();
        let rx = state
            .error_input("id1", Some("cancelled".into()))
            .expect("synthesized errored stream");
        let items: Vec<_> = rx.collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap_err().is_aborted());
    }

    #[tokio::test]
    async fn deferred_abort_reason_is_recorded_until_token_exists() {
        let state: InvokeServerState<u32> = InvokeServerState::new();
        assert!(state.record_abort("id1", Some("early".into())).is_none());
        assert_eq!(state.take_deferred_abort("id1"), Some(Some("early".into())));
        assert_eq!(state.take_deferred_abort("id1"), None);
    }

    #[tokio::test]
    async fn abort_after_token_exists_returns_it_for_tripping() {
        let state: InvokeServerState<u32> = InvokeServerState::new();
        let token = state.token_for("id1");
        assert!(!token.is_cancelled());
        let found = state.record_abort("id1", None).expect("token already existed");
        found.cancel();
        assert!(token.is_cancelled());
    }
}
