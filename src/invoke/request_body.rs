//! The client-side request shape: either a single value or a lazy sequence
//! of chunks, per spec.md §9's "is this value a pull-based sequence we
//! should consume chunk-by-chunk?" capability predicate.
//!
//! Rust has no ambient duck-typed answer to that question, so the
//! predicate becomes a closed sum type at the call site instead: callers
//! either hand over one `Req` or a `Stream` of them.

use futures::stream::BoxStream;

use crate::error::EventaError;

/// What a caller passes to `invoke`/`define_stream_invoke`'s client.
pub enum RequestBody<Req> {
    /// A single request value — the common case.
    Unary(Req),
    /// A client-streaming request: consumed chunk by chunk, terminated by
    /// the stream ending (success) or yielding an `Err` (producer failure).
    Stream(BoxStream<'static, Result<Req, EventaError>>),
}

impl<Req> From<Req> for RequestBody<Req> {
    fn from(value: Req) -> Self {
        RequestBody::Unary(value)
    }
}

impl<Req> RequestBody<Req> {
    /// Wrap an existing stream of chunks as a client-streaming request.
    pub fn stream(s: BoxStream<'static, Result<Req, EventaError>>) -> Self {
        RequestBody::Stream(s)
    }
}
