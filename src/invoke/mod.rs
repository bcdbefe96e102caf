//! The invoke (RPC) runtime built on top of [`crate::bus`]: unary and
//! streaming request/response methods, correlation-id derived descriptor
//! families, and cooperative cancellation.

mod cancellation;
mod family;
mod options;
mod request_body;
mod state;
mod streaming;
mod unary;

pub use family::{
    InvokeAbortBody, InvokeBody, InvokeEndBody, InvokeErrorBody, InvokeFamily,
};
pub use options::{HandlerResponse, InvokeOptions};
pub use request_body::RequestBody;
pub use state::InputReceiver;
pub use streaming::{
    define_stream_invoke, define_stream_invoke_handler, BoxStreamHandler, InvokeStreamClient,
    StreamHandlerDisposer,
};
pub use unary::{
    define_invoke, define_invoke_handler, BoxUnaryHandler, InvokeClient, InvokeHandlerDisposer,
};
