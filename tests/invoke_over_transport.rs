//! End-to-end scenarios wiring two independent [`Context`]s together over
//! [`InProcessAdapter`], the way a real transport would: nothing here
//! reaches across contexts except through `attach`'s wildcard-subscribe /
//! re-emit pump, so these tests exercise the full invoke protocol on the
//! wire shape described by the adapter contract rather than a single
//! shared bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use eventa_core::remote_methods::{self, OnDisallowedTag, RemoteMethodsConfig, RemoteValue};
use eventa_core::transport::{attach, InProcessAdapter};
use eventa_core::{
    define_invoke, define_invoke_handler, define_stream_invoke, define_stream_invoke_handler,
    BoxStreamHandler, BoxUnaryHandler, Context, HandlerResponse, InvokeFamily, InvokeOptions,
};

fn wire_pair() -> (Context, Context) {
    let client_ctx = Context::new();
    let server_ctx = Context::new();
    let (client_adapter, server_adapter) = InProcessAdapter::pair("client", "server");
    // Leak the attachments deliberately: the pumps must outlive the test
    // body, and each test only ever wires one pair.
    Box::leak(Box::new(attach(&client_ctx, client_adapter)));
    Box::leak(Box::new(attach(&server_ctx, server_adapter)));
    (client_ctx, server_ctx)
}

/// Scenario 1: unary request/response, client and server on separate buses.
#[tokio::test]
async fn unary_request_response_over_the_wire() {
    let (client_ctx, server_ctx) = wire_pair();
    let family = InvokeFamily::new("greet");

    let handler: BoxUnaryHandler<Value, Value> = Arc::new(|input, _opts| {
        Box::pin(async move {
            let mut input = input;
            let req = input.next().await.unwrap().unwrap();
            let name = req["name"].as_str().unwrap_or_default();
            let age = req["age"].as_i64().unwrap_or_default();
            Ok(HandlerResponse::plain(json!({ "id": format!("{name}-{age}") })))
        })
    });
    let _disposer = define_invoke_handler::<Value, Value>(&server_ctx, family.clone(), handler);

    let client = define_invoke::<Value, Value>(&client_ctx, family);
    let result = client
        .invoke(json!({"name": "alice", "age": 25}), InvokeOptions::none())
        .await
        .unwrap();
    assert_eq!(result, json!({"id": "alice-25"}));
}

/// Scenario 2: three concurrent unary calls on one shared family are
/// isolated solely by correlation id, even across the wire.
#[tokio::test]
async fn concurrent_unary_calls_are_isolated_by_correlation_id() {
    let (client_ctx, server_ctx) = wire_pair();
    let family = InvokeFamily::new("double");

    let handler: BoxUnaryHandler<Value, Value> = Arc::new(|input, _opts| {
        Box::pin(async move {
            let mut input = input;
            let req = input.next().await.unwrap().unwrap();
            let value = req["value"].as_i64().unwrap_or_default();
            Ok(HandlerResponse::plain(json!({ "result": value * 2 })))
        })
    });
    let _disposer = define_invoke_handler::<Value, Value>(&server_ctx, family.clone(), handler);

    let client = define_invoke::<Value, Value>(&client_ctx, family);
    let (a, b, c) = tokio::join!(
        client.invoke(json!({"value": 10}), InvokeOptions::none()),
        client.invoke(json!({"value": 20}), InvokeOptions::none()),
        client.invoke(json!({"value": 50}), InvokeOptions::none()),
    );
    assert_eq!(a.unwrap(), json!({"result": 20}));
    assert_eq!(b.unwrap(), json!({"result": 40}));
    assert_eq!(c.unwrap(), json!({"result": 100}));
}

/// Scenario 4: client-streaming request summed by the handler.
#[tokio::test]
async fn client_streaming_request_over_the_wire() {
    let (client_ctx, server_ctx) = wire_pair();
    let family = InvokeFamily::new("sum-remote");

    let handler: BoxUnaryHandler<u32, u32> = Arc::new(|input, _opts| {
        Box::pin(async move {
            let total: u32 = input
                .filter_map(|r| async move { r.ok() })
                .fold(0, |a, b| async move { a + b })
                .await;
            Ok(HandlerResponse::plain(total))
        })
    });
    let _disposer = define_invoke_handler::<u32, u32>(&server_ctx, family.clone(), handler);

    let client = define_invoke::<u32, u32>(&client_ctx, family);
    let chunks = futures::stream::iter(vec![Ok(1u32), Ok(2), Ok(3)]).boxed();
    let result = client
        .invoke(eventa_core::RequestBody::stream(chunks), InvokeOptions::none())
        .await
        .unwrap();
    assert_eq!(result, 6);
}

/// Scenario 3: a streaming server producing a parameters/progress/result
/// shaped sequence, observed in order by the client across the wire.
#[tokio::test]
async fn streaming_server_emits_chunks_in_order() {
    let (client_ctx, server_ctx) = wire_pair();
    let family = InvokeFamily::new("track-progress");

    let producer: BoxStreamHandler<Value, Value> = Arc::new(|_input, _opts| {
        Box::pin(async move {
            let mut items = vec![json!({"type": "parameters", "name": "alice", "age": 25})];
            for pct in [20, 40, 60, 80, 100] {
                items.push(json!({"type": "progress", "progress": pct}));
            }
            items.push(json!({"type": "result", "result": true}));
            futures::stream::iter(items.into_iter().map(Ok)).boxed()
        })
    });
    let _disposer = define_stream_invoke_handler(&server_ctx, family.clone(), producer);

    let client = define_stream_invoke::<Value, Value>(&client_ctx, family);
    let items: Vec<Value> = client
        .invoke(Value::Null, InvokeOptions::none())
        .map(|r| r.unwrap())
        .collect()
        .await;

    assert_eq!(items.len(), 7);
    assert_eq!(items[0]["type"], "parameters");
    let progress_count = items
        .iter()
        .filter(|v| v["type"] == "progress")
        .count();
    assert_eq!(progress_count, 5);
    assert_eq!(items[6]["type"], "result");
}

/// Scenario 5 (abridged): the client cancels mid-stream; the call settles
/// as Aborted and the server-side handler observes the same on its input
/// side once its own chunks stop arriving (here: a counting producer that
/// the client tears down early, which is the client-cancel half of the
/// scenario the unit-level cancellation tests already cover server-side).
#[tokio::test]
async fn abort_mid_stream_settles_as_aborted_on_both_ends() {
    let (client_ctx, server_ctx) = wire_pair();
    let family = InvokeFamily::new("tick");

    let reached = Arc::new(AtomicUsize::new(0));
    let reached_producer = reached.clone();
    let producer: BoxStreamHandler<(), i64> = Arc::new(move |_input, options| {
        let reached = reached_producer.clone();
        Box::pin(async move {
            let cancel = options.cancel.clone();
            futures::stream::iter(1..=10)
                .then(move |n| {
                    let reached = reached.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        reached.fetch_add(1, Ordering::SeqCst);
                        n
                    }
                })
                .take_while(move |_| {
                    let cancelled = cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false);
                    async move { !cancelled }
                })
                .map(Ok)
                .boxed()
        })
    });
    let _disposer = define_stream_invoke_handler(&server_ctx, family.clone(), producer);

    let client = define_stream_invoke::<(), i64>(&client_ctx, family);
    let cancel = CancellationToken::new();
    let mut stream = client.invoke((), InvokeOptions::none().with_cancel(cancel.clone()));

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(210)).await;
        cancel.cancel();
    });

    let mut saw_abort = false;
    while let Some(item) = stream.next().await {
        match item {
            Ok(_) => continue,
            Err(e) => {
                assert!(e.is_aborted());
                saw_abort = true;
                break;
            }
        }
    }
    assert!(saw_abort, "stream should settle with an Aborted error");

    // Give the cancel-driven teardown a moment to stop the producer, then
    // confirm it did not run to completion.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let n = reached.load(Ordering::SeqCst);
    assert!(n < 10, "producer should have been cut off before reaching 10, got {n}");
}

/// Scenario 6: prototype-pollution defense. A `__proto__`-keyed payload
/// round-trips as plain data; the runtime never materializes anything but
/// `serde_json::Map`, so there is no global prototype to pollute in the
/// first place.
#[tokio::test]
async fn proto_keyed_payload_round_trips_as_inert_data() {
    let ctx = Context::new();
    let config = RemoteMethodsConfig::default();

    let payload = json!({"__proto__": {"test": "value"}});
    let serialized = remote_methods::serialize(&ctx, RemoteValue::from(payload.clone()), &config).unwrap();
    assert_eq!(serialized.value, payload);

    let deserialized = remote_methods::deserialize(&ctx, serialized.value, &config).unwrap();
    match deserialized {
        RemoteValue::Object(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].0, "__proto__");
            match &entries[0].1 {
                RemoteValue::Object(inner) => {
                    assert_eq!(inner.len(), 1);
                    assert_eq!(inner[0].0, "test");
                }
                other => panic!("expected nested object, got a different shape: {}", matches!(other, RemoteValue::Value(_))),
            }
        }
        other => panic!("expected an object, got a different RemoteValue variant (is_value={})", matches!(other, RemoteValue::Value(_))),
    }
    serialized.dispose.dispose();
}

/// Remote methods round trip: a function embedded in a request payload is
/// replaced by a stub on serialize, rehydrated as an invokable client on
/// the peer, and its return value matches calling the original directly.
#[tokio::test]
async fn remote_method_function_round_trips_and_is_callable() {
    let (client_ctx, server_ctx) = wire_pair();
    let config = RemoteMethodsConfig {
        tag_prefix: "rpc-fn-".to_string(),
        on_disallowed_tag: OnDisallowedTag::Ignore,
        ..RemoteMethodsConfig::default()
    };

    // The "client" context owns the real function and serializes it for
    // sending to the "server" as part of a request payload.
    let original = RemoteValue::function(Arc::new(|arg: Value| {
        Box::pin(async move {
            let n = arg.as_i64().unwrap_or(0);
            Ok(json!(n * 10))
        }) as futures::future::BoxFuture<'static, Result<Value, Value>>
    }));
    let serialized = remote_methods::serialize(&client_ctx, original, &config).unwrap();
    assert!(serialized.value.get("__marker").is_some());

    // The payload crosses the wire as plain JSON; the server rehydrates
    // the stub against its own context, bound to the invoke family the
    // client registered a handler for.
    let rehydrated = remote_methods::deserialize(&server_ctx, serialized.value, &config).unwrap();
    let callback = match rehydrated {
        RemoteValue::Function(f) => f,
        other => panic!("expected a rehydrated function stub, got a different shape (is_value={})", matches!(other, RemoteValue::Value(_))),
    };

    let result = callback(json!(4)).await.unwrap();
    assert_eq!(result, json!(40));

    serialized.dispose.dispose();
}

/// Scenario 7: a fatal transport event rejects every pending call on the
/// context that registered it, even with no response ever in flight.
#[tokio::test]
async fn fatal_event_rejects_pending_calls() {
    let ctx = Context::new();
    let fatal_descriptor = eventa_core::EventDescriptor::<Value>::new("link-down");
    ctx.register_fatal_source(&fatal_descriptor);

    // No handler registered: the call would otherwise hang forever.
    let family = InvokeFamily::new("never-answered");
    let client = define_invoke::<Value, Value>(&ctx, family);
    let pending = client.invoke(json!(null), InvokeOptions::none());

    let ctx2 = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx2.emit(&fatal_descriptor, json!("connection reset"), None);
    });

    let result = pending.await;
    match result {
        Err(eventa_core::EventaError::Fatal(v)) => assert_eq!(v, json!("connection reset")),
        other => panic!("expected a Fatal error, got {other:?}"),
    }
}
