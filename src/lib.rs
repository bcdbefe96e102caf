//! # Eventa Core
//!
//! A transport-agnostic event bus and invoke (RPC) runtime: an in-process
//! publish/subscribe registry over typed descriptors, an invoke layer built
//! on top of it for correlated unary and streaming request/response calls,
//! cooperative cancellation, a remote-methods boundary for passing function
//! values across that wire, and the adapter contract a concrete transport
//! implements to plug into a context.

pub mod bus;
pub mod descriptor;
pub mod error;
pub mod id;
pub mod invoke;
pub mod matcher;
pub mod remote_methods;
pub mod transport;

pub use bus::{Context, EmitOptions, Envelope, ListenerErrorHook, ListenerFn};
pub use descriptor::{define_event, EventDescriptor, FlowDirection, InvokeRole};
pub use error::EventaError;
pub use invoke::{
    define_invoke, define_invoke_handler, define_stream_invoke, define_stream_invoke_handler,
    BoxStreamHandler, BoxUnaryHandler, HandlerResponse, InputReceiver, InvokeClient, InvokeFamily,
    InvokeHandlerDisposer, InvokeOptions, InvokeStreamClient, RequestBody, StreamHandlerDisposer,
};
pub use matcher::{DescriptorMeta, Match};
pub use remote_methods::{
    deserialize, serialize, with_remote_methods, DisposeHandle, OnDisallowedTag, RemoteCall,
    RemoteInvokeClient, RemoteInvokeStreamClient, RemoteMethods, RemoteMethodsConfig, RemoteStream,
    RemoteValue, SerializedPayload,
};
pub use transport::{
    attach, AttachedTransport, Frame, InProcessAdapter, TransportAdapter, TransportFailure,
};

/// The crate's version, as set in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
