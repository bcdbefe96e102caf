//! # Eventa Core Demo — Main Entry Point
//!
//! A small runnable scenario picker exercising the library end to end:
//! each scenario wires a client context and a server context together
//! over [`transport::InProcessAdapter`] via [`eventa_core::transport::attach`]
//! and drives one corner of the invoke runtime.
//!
//! ## Architecture Overview
//!
//! 1. **Initialize logging**: sets up structured logging with tracing,
//!    identical in approach to a production service even though this is a
//!    demo binary.
//! 2. **Parse arguments**: which scenario(s) to run and how verbose to be.
//! 3. **Run each scenario**: build a fresh context pair, run the call(s),
//!    print what was observed, tear the pair down.
//!
//! ## Error Handling
//!
//! Uses `anyhow::Result` throughout, matching the demo-binary convention of
//! keeping the library surface free of `anyhow` while the binary leans on
//! it for simple top-level error propagation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use eventa_core::remote_methods::{self, OnDisallowedTag, RemoteMethodsConfig, RemoteValue};
use eventa_core::transport::{attach, AttachedTransport, InProcessAdapter};
use eventa_core::{
    define_invoke, define_invoke_handler, define_stream_invoke, define_stream_invoke_handler,
    BoxStreamHandler, BoxUnaryHandler, Context, HandlerResponse, InvokeFamily, InvokeOptions,
};

mod cli;
mod logging;

use cli::{Args, Scenario};
use logging::ColorizedFormatter;

/// Main application entry point.
///
/// Runs each selected scenario in turn, on Tokio's multi-threaded runtime
/// (the streaming scenarios spawn background producer tasks alongside the
/// main call, so a single-threaded runtime would still work but the
/// multi-threaded one is what a real adapter-backed service would use).
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("eventa-demo.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "eventa-demo.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();
    let _log_guard = guard;

    info!("Starting Eventa Core demo");

    for scenario in args.scenario.expand_all() {
        info!("--- scenario: {scenario} ---");
        match scenario {
            Scenario::Unary => run_unary().await?,
            Scenario::Streaming => run_streaming().await?,
            Scenario::Cancel => run_cancel().await?,
            Scenario::RemoteMethods => run_remote_methods().await?,
            Scenario::All => unreachable!("expand_all never yields All"),
        }
    }

    info!("Eventa Core demo completed successfully");
    Ok(())
}

/// Build a connected client/server context pair over the in-process
/// reference transport adapter.
fn wire(client_name: &str, server_name: &str) -> (Context, Context, AttachedTransport, AttachedTransport) {
    let client_ctx = Context::new();
    let server_ctx = Context::new();
    let (client_adapter, server_adapter) = InProcessAdapter::pair(client_name, server_name);
    let client_transport = attach(&client_ctx, client_adapter);
    let server_transport = attach(&server_ctx, server_adapter);
    (client_ctx, server_ctx, client_transport, server_transport)
}

/// A plain unary round trip: the client sends one number, the server
/// doubles it and replies.
async fn run_unary() -> Result<()> {
    let (client_ctx, server_ctx, client_transport, server_transport) = wire("client", "server");
    let family = InvokeFamily::new("double");

    let handler: BoxUnaryHandler<i64, i64> = Arc::new(|input, _options| {
        Box::pin(async move {
            let mut input = input;
            let n = input
                .next()
                .await
                .transpose()
                .map_err(|e| Value::String(e.to_string()))?
                .unwrap_or(0);
            Ok(HandlerResponse::plain(n * 2))
        })
    });
    let _disposer = define_invoke_handler::<i64, i64>(&server_ctx, family.clone(), handler);

    let client = define_invoke::<i64, i64>(&client_ctx, family);
    let result = client.invoke(21, InvokeOptions::none()).await?;
    info!("unary: 21 doubled -> {result}");
    assert_eq!(result, 42);

    client_transport.shutdown();
    server_transport.shutdown();
    Ok(())
}

/// A server-produced stream of responses: the client opens a countdown and
/// consumes each chunk as the server produces it.
async fn run_streaming() -> Result<()> {
    let (client_ctx, server_ctx, client_transport, server_transport) = wire("client", "server");
    let family = InvokeFamily::new("countdown");

    let handler: BoxStreamHandler<(), i64> = Arc::new(|_input, _options| {
        Box::pin(async move {
            futures::stream::iter((0..3).rev())
                .then(|n| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(n)
                })
                .boxed()
        })
    });
    let _disposer = define_stream_invoke_handler::<(), i64>(&server_ctx, family.clone(), handler);

    let client = define_stream_invoke::<(), i64>(&client_ctx, family);
    let mut responses = client.invoke((), InvokeOptions::none());
    let mut seen = Vec::new();
    while let Some(item) = responses.next().await {
        let n = item?;
        info!("streaming: received {n}");
        seen.push(n);
    }
    assert_eq!(seen, vec![2, 1, 0]);

    client_transport.shutdown();
    server_transport.shutdown();
    Ok(())
}

/// The same countdown as [`run_streaming`], but the client cancels partway
/// through and observes the call settle as `Aborted`.
async fn run_cancel() -> Result<()> {
    let (client_ctx, server_ctx, client_transport, server_transport) = wire("client", "server");
    let family = InvokeFamily::new("slow-countdown");

    let handler: BoxStreamHandler<(), i64> = Arc::new(|_input, options| {
        Box::pin(async move {
            let cancel = options.cancel.clone();
            futures::stream::iter(0..100)
                .then(|n| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    n
                })
                .take_while(move |n| {
                    let cancelled = cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false);
                    futures::future::ready(!cancelled && *n < 100)
                })
                .map(Ok)
                .boxed()
        })
    });
    let _disposer = define_stream_invoke_handler::<(), i64>(&server_ctx, family.clone(), handler);

    let client = define_stream_invoke::<(), i64>(&client_ctx, family);
    let cancel = CancellationToken::new();
    let mut responses = client.invoke((), InvokeOptions::none().with_cancel(cancel.clone()));

    let first = responses.next().await.transpose()?;
    info!("cancel: received {first:?} before cancelling");
    cancel.cancel();

    let mut saw_aborted = false;
    while let Some(item) = responses.next().await {
        match item {
            Ok(n) => info!("cancel: received {n} after cancelling (race with the producer)"),
            Err(err) => {
                info!("cancel: call settled as {err}");
                saw_aborted = err.is_aborted();
            }
        }
    }
    assert!(saw_aborted, "the call should settle with Aborted after cancellation");

    client_transport.shutdown();
    server_transport.shutdown();
    Ok(())
}

/// A function value is serialized on the server side, deserialized on the
/// client side as a callable stub, and invoked across the wire.
async fn run_remote_methods() -> Result<()> {
    let (client_ctx, server_ctx, client_transport, server_transport) = wire("client", "server");
    let config = RemoteMethodsConfig {
        on_disallowed_tag: OnDisallowedTag::Throw,
        ..RemoteMethodsConfig::default()
    };
    let family = InvokeFamily::new("get-adder");

    {
        let handler_ctx = server_ctx.clone();
        let handler_config = config.clone();
        let handler: BoxUnaryHandler<(), Value> = Arc::new(move |_input, _options| {
            let server_ctx = handler_ctx.clone();
            let config = handler_config.clone();
            Box::pin(async move {
                let adder: remote_methods::RemoteFn = Arc::new(|arg: Value| -> BoxFuture<'static, Result<Value, Value>> {
                    Box::pin(async move { Ok(Value::from(arg.as_i64().unwrap_or(0) + 1)) })
                });
                let payload = remote_methods::serialize(&server_ctx, RemoteValue::function(adder), &config)
                    .map_err(|e| Value::String(e.to_string()))?;
                // Kept alive for the demo's duration; a real caller would tie
                // `payload.dispose` to the originating call's own lifetime.
                let _dispose_guard = payload.dispose;
                Ok(HandlerResponse::plain(payload.value))
            })
        });
        let _disposer = define_invoke_handler::<(), Value>(&server_ctx, family.clone(), handler);
    }

    let client = define_invoke::<(), Value>(&client_ctx, family);
    let stub_value = client.invoke((), InvokeOptions::none()).await?;
    let remote = remote_methods::deserialize(&client_ctx, stub_value, &config)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let RemoteValue::Function(adder_stub) = remote else {
        anyhow::bail!("expected a function stub back from get-adder");
    };

    let result = adder_stub(Value::from(41))
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    info!("remote-methods: 41 + 1 -> {result}");
    assert_eq!(result, Value::from(42));

    client_transport.shutdown();
    server_transport.shutdown();
    Ok(())
}
