//! Endpoint multiplexing integration tests.
//!
//! Tests frame routing between endpoints sharing one stream, acknowledgement
//! correlation in both directions, endpoint lifecycle, heartbeats, the
//! inactivity watchdog, and reconnection with rejoin and exhaustion.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use common::{eventually, recorder, within, StaticHttp, TestServer};
use sio_client::{ConnectionState, EndpointClient, MemoryPeer, Packet};
use sio_core::error::SioError;

/// Join `name` from `client`, answering as the server.
async fn join(client: &EndpointClient, peer: &mut MemoryPeer, name: &str) -> EndpointClient {
    let c = client.clone();
    let n = name.to_string();
    let task = tokio::spawn(async move { c.join(&n).await });
    assert_eq!(within(peer.recv_data()).await, Some(format!("1::{name}")));
    assert!(peer.send(format!("1::{name}")));
    within(task).await.unwrap().unwrap()
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    (count, move || {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

// ---- Routing ----

#[tokio::test]
async fn e2e_frames_route_to_their_endpoint_in_order() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;
    let chat = join(&root, &mut peer, "/chat").await;

    let root_strings = recorder();
    let chat_strings = recorder();
    let chat_json = recorder();
    let root_events = recorder();

    let r = root_strings.clone();
    root.set_string_callback(move |msg, _| r.lock().push(msg.to_string()));
    let c = chat_strings.clone();
    chat.set_string_callback(move |msg, _| c.lock().push(msg.to_string()));
    let j = chat_json.clone();
    chat.set_json_callback(move |value, _| j.lock().push(value.clone()));
    let e = root_events.clone();
    root.set_event_callback(move |name, _, _| e.lock().push(name.to_string()));

    peer.send("3:::to-root");
    peer.send("3::/chat:to-chat");
    peer.send("3::/nowhere:lost");
    peer.send(r#"4::/chat:{"a":1}"#);
    peer.send("4::/chat:{broken");
    peer.send("5:::not-json");
    peer.send("9:::unknown type");
    peer.send(r#"5:::{"name":"done","args":[]}"#);

    eventually(|| !root_events.lock().is_empty()).await;
    assert_eq!(*root_strings.lock(), vec!["to-root".to_string()]);
    assert_eq!(*chat_strings.lock(), vec!["to-chat".to_string()]);
    assert_eq!(*chat_json.lock(), vec![json!({"a": 1})]);
    assert_eq!(*root_events.lock(), vec!["done".to_string()]);
}

#[tokio::test]
async fn e2e_outgoing_frames_carry_endpoint() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;
    let chat = join(&root, &mut peer, "/chat").await;

    root.emit("plain");
    chat.emit_json(&json!({"k": "v"}));
    chat.emit_event("greet", &json!(["bob", 3]));
    chat.emit_event("bare", &());

    assert_eq!(within(peer.recv_data()).await.as_deref(), Some("3:::plain"));
    assert_eq!(
        within(peer.recv_data()).await.as_deref(),
        Some(r#"4::/chat:{"k":"v"}"#)
    );
    assert_eq!(
        within(peer.recv_data()).await.as_deref(),
        Some(r#"5::/chat:{"name":"greet","args":["bob",3]}"#)
    );
    assert_eq!(
        within(peer.recv_data()).await.as_deref(),
        Some(r#"5::/chat:{"name":"bare","args":[]}"#)
    );
}

#[tokio::test]
async fn e2e_named_listener_wins_over_generic_event_callback() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, peer) = server.connect_root().await;

    let named = recorder();
    let generic = recorder();
    let n = named.clone();
    root.on("news", move |args, _| n.lock().push(args.to_vec()));
    let g = generic.clone();
    root.set_event_callback(move |name, _, _| g.lock().push(name.to_string()));

    peer.send(r#"5:::{"name":"news","args":[{"id":1}]}"#);
    peer.send(r#"5:::{"name":"weather","args":[]}"#);

    eventually(|| generic.lock().len() == 1).await;
    assert_eq!(*named.lock(), vec![vec![json!({"id": 1})]]);
    assert_eq!(*generic.lock(), vec!["weather".to_string()]);
}

// ---- Acknowledgements ----

#[tokio::test]
async fn e2e_ack_callbacks_match_their_ids() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;

    let fired = recorder();
    let f = fired.clone();
    root.emit_with_ack("first", move |result| f.lock().push(("first", result)));
    let f = fired.clone();
    root.emit_with_ack("second", move |result| f.lock().push(("second", result)));

    assert_eq!(within(peer.recv_data()).await.as_deref(), Some("3:1+::first"));
    assert_eq!(within(peer.recv_data()).await.as_deref(), Some("3:2+::second"));

    // Acks fire in arrival order, not emit order.
    peer.send(r#"6:::2+["b"]"#);
    peer.send("6:::1");
    peer.send("6:::99");

    eventually(|| fired.lock().len() == 2).await;
    assert_eq!(
        *fired.lock(),
        vec![("second", Ok(vec![json!("b")])), ("first", Ok(vec![]))]
    );
    assert_eq!(root.connection().pending_acks(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn e2e_concurrent_emits_get_distinct_ids() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;

    let fired = recorder();
    let mut tasks = Vec::new();
    for i in 0..16 {
        let client = root.clone();
        let f = fired.clone();
        tasks.push(tokio::spawn(async move {
            let message = format!("m{i}");
            let tag = message.clone();
            client.emit_with_ack(&message, move |_| f.lock().push(tag));
        }));
    }
    for task in tasks {
        within(task).await.unwrap();
    }

    let mut by_id = Vec::new();
    for _ in 0..16 {
        let frame = within(peer.recv_data()).await.unwrap();
        let packet = Packet::decode(&frame).unwrap();
        by_id.push((packet.id.unwrap(), packet.data));
    }
    let ids: HashSet<u64> = by_id.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids.len(), 16);
    assert!(ids.iter().all(|id| (1..=16).contains(id)));

    let (id, message) = by_id[7].clone();
    peer.send(format!("6:::{id}"));
    eventually(|| fired.lock().len() == 1).await;
    assert_eq!(*fired.lock(), vec![message]);
    assert_eq!(root.connection().pending_acks(), 15);
}

#[tokio::test]
async fn e2e_emit_event_acked_returns_server_args() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;

    let client = root.clone();
    let task = tokio::spawn(async move { client.emit_event_acked("sum", &[1, 2]).await });

    assert_eq!(
        within(peer.recv_data()).await.as_deref(),
        Some(r#"5:1+::{"name":"sum","args":[1,2]}"#)
    );
    peer.send("6:::1+[3]");
    assert_eq!(within(task).await.unwrap(), Ok(vec![json!(3)]));
}

#[tokio::test]
async fn e2e_server_requested_ack_carries_reply() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;
    let chat = join(&root, &mut peer, "/chat").await;

    chat.on("double", |args, ack| {
        let n = args.first().and_then(Value::as_i64).unwrap_or_default();
        let ack = ack.expect("sender asked for an ack");
        assert_eq!(ack.id(), 9);
        ack.ack(vec![json!(n * 2)]).unwrap();
    });

    peer.send(r#"5:9+:/chat:{"name":"double","args":[21]}"#);
    assert_eq!(within(peer.recv_data()).await.as_deref(), Some("6::/chat:9+[42]"));
}

#[tokio::test]
async fn e2e_plain_message_id_is_acked_automatically() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;

    let seen = recorder();
    let s = seen.clone();
    root.set_string_callback(move |msg, ack| s.lock().push((msg.to_string(), ack.is_some())));

    peer.send("3:5::hello");
    assert_eq!(within(peer.recv_data()).await.as_deref(), Some("6:::5"));
    eventually(|| !seen.lock().is_empty()).await;
    assert_eq!(*seen.lock(), vec![("hello".to_string(), false)]);
}

#[tokio::test(start_paused = true)]
async fn e2e_unanswered_ack_times_out() {
    let mut config = common::create_test_config();
    config.acknowledgement.timeout_ms = 50;
    let mut server = TestServer::with_http(StaticHttp::ok("s:30:60:websocket"), config);
    let (root, _peer) = server.connect_root().await;

    let result = recorder();
    let r = result.clone();
    root.emit_with_ack("anyone?", move |outcome| r.lock().push(outcome));

    eventually(|| !result.lock().is_empty()).await;
    assert_eq!(*result.lock(), vec![Err(SioError::AckTimeout(1))]);
    assert_eq!(root.connection().pending_acks(), 0);
}

// ---- Endpoint lifecycle ----

#[tokio::test]
async fn e2e_emit_after_disconnect_is_dropped() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;
    let chat = join(&root, &mut peer, "/chat").await;

    let disconnects = recorder();
    let d = disconnects.clone();
    chat.set_disconnect_callback(move |err| d.lock().push(err.cloned()));

    chat.disconnect();
    assert!(chat.is_disconnected());
    assert!(!chat.is_connected());
    assert_eq!(*disconnects.lock(), vec![None]);

    let ack = recorder();
    let a = ack.clone();
    chat.emit("ignored");
    chat.emit_with_ack("ignored", move |outcome| a.lock().push(outcome));
    assert_eq!(*ack.lock(), vec![Err(SioError::NotConnected)]);

    root.emit("sentinel");
    assert_eq!(within(peer.recv_data()).await.as_deref(), Some("0::/chat"));
    assert_eq!(within(peer.recv_data()).await.as_deref(), Some("3:::sentinel"));
    assert_eq!(root.connection().endpoints(), vec![String::new()]);
}

#[tokio::test]
async fn e2e_joining_same_namespace_twice_fails() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;
    let _chat = join(&root, &mut peer, "/chat").await;

    let result = within(root.join("/chat")).await;
    assert_eq!(result.unwrap_err(), SioError::DuplicateEndpoint("/chat".into()));
}

#[tokio::test]
async fn e2e_server_disconnect_is_terminal_for_endpoint() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;
    let chat = join(&root, &mut peer, "/chat").await;

    let disconnects = recorder();
    let d = disconnects.clone();
    chat.set_disconnect_callback(move |err| d.lock().push(err.cloned()));
    let strings = recorder();
    let s = strings.clone();
    chat.set_string_callback(move |msg, _| s.lock().push(msg.to_string()));
    let root_strings = recorder();
    let r = root_strings.clone();
    root.set_string_callback(move |msg, _| r.lock().push(msg.to_string()));

    peer.send("0::/chat");
    peer.send("3::/chat:late");
    peer.send("3:::sentinel");

    eventually(|| !root_strings.lock().is_empty()).await;
    assert_eq!(*disconnects.lock(), vec![None]);
    assert!(strings.lock().is_empty());
    assert!(chat.is_disconnected());
    assert!(root.is_connected());
    assert_eq!(root.connection().endpoints(), vec![String::new()]);

    // Already notified by the server's frame.
    chat.disconnect();
    assert_eq!(*disconnects.lock(), vec![None]);
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn e2e_root_disconnect_frame_closes_connection() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;
    let chat = join(&root, &mut peer, "/chat").await;

    let (root_count, on_root) = counter();
    root.set_disconnect_callback(move |_| on_root());
    let (chat_count, on_chat) = counter();
    chat.set_disconnect_callback(move |_| on_chat());

    peer.send("0::");
    assert_eq!(within(peer.recv_data()).await, None);
    assert_eq!(root_count.load(Ordering::SeqCst), 1);
    assert_eq!(chat_count.load(Ordering::SeqCst), 1);
    assert!(root.connection().is_closed());
    assert_eq!(root.connection().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn e2e_error_frame_reaches_joined_endpoint() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;
    let chat = join(&root, &mut peer, "/chat").await;

    let errors = recorder();
    let e = errors.clone();
    chat.set_error_callback(move |reason| e.lock().push(reason.to_string()));

    peer.send("7::/chat:bad request");
    eventually(|| !errors.lock().is_empty()).await;
    assert_eq!(*errors.lock(), vec!["bad request".to_string()]);
    assert!(chat.is_connected());
}

#[tokio::test]
async fn e2e_last_disconnect_tears_down_stream() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;
    let chat = join(&root, &mut peer, "/chat").await;

    // Leaving the root namespace while /chat is open sends nothing.
    root.disconnect();
    chat.emit("still here");
    assert_eq!(
        within(peer.recv_data()).await.as_deref(),
        Some("3::/chat:still here")
    );
    assert!(!chat.connection().is_closed());

    chat.disconnect();
    assert_eq!(within(peer.recv_data()).await.as_deref(), Some("0::/chat"));
    assert_eq!(within(peer.recv_data()).await, None);
    assert!(chat.connection().is_closed());
    assert_eq!(chat.connection().state(), ConnectionState::Disconnected);
}

// ---- Heartbeat and watchdog ----

#[tokio::test(start_paused = true)]
async fn e2e_heartbeats_at_half_the_server_timeout() {
    let mut server = TestServer::new("hb:2:60:websocket");
    let (_root, mut peer) = server.connect_root().await;

    let start = tokio::time::Instant::now();
    assert_eq!(within(peer.recv()).await.as_deref(), Some("2::"));
    let first = start.elapsed();
    assert!(first <= Duration::from_secs(1));
    assert_eq!(within(peer.recv()).await.as_deref(), Some("2::"));
    assert_eq!(start.elapsed() - first, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn e2e_silent_stream_is_reopened() {
    let mut server = TestServer::new("w:2:1:websocket");
    let (root, _peer) = server.connect_root().await;
    let (reconnects, on_reconnect) = counter();
    root.set_reconnect_callback(on_reconnect);

    let _second = server.accept().await;
    eventually(|| reconnects.load(Ordering::SeqCst) == 1).await;
    assert_eq!(server.connector.opened_urls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn e2e_idle_session_without_heartbeats_stays_open() {
    let mut server = TestServer::new("s::60:websocket");
    let (root, mut peer) = server.connect_root().await;
    let (reconnects, on_reconnect) = counter();
    root.set_reconnect_callback(on_reconnect);

    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(server.connector.opened_urls().len(), 1);
    assert!(server.listener.try_accept().is_none());
    assert!(root.is_connected());
    assert_eq!(reconnects.load(Ordering::SeqCst), 0);
    assert!(peer.try_recv().is_none());
}

// ---- Reconnection ----

#[tokio::test]
async fn e2e_reconnect_while_connected_keeps_the_stream() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;
    let (reconnects, on_reconnect) = counter();
    root.set_reconnect_callback(on_reconnect);

    root.connection().reconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(server.connector.opened_urls().len(), 1);
    assert!(server.listener.try_accept().is_none());
    assert_eq!(reconnects.load(Ordering::SeqCst), 0);

    root.emit("same stream");
    assert_eq!(within(peer.recv_data()).await.as_deref(), Some("3:::same stream"));
}

#[tokio::test]
async fn e2e_reconnect_rejoins_and_notifies_endpoints() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;
    let chat = join(&root, &mut peer, "/chat").await;

    let (root_reconnects, on_root) = counter();
    root.set_reconnect_callback(on_root);
    let (chat_reconnects, on_chat) = counter();
    chat.set_reconnect_callback(on_chat);

    let acks = recorder();
    let a = acks.clone();
    root.emit_with_ack("in flight", move |outcome| a.lock().push(outcome));
    assert_eq!(within(peer.recv_data()).await.as_deref(), Some("3:1+::in flight"));

    drop(peer);
    let mut peer = server.accept().await;

    // Acks written to the lost stream are failed, not carried over.
    eventually(|| !acks.lock().is_empty()).await;
    assert_eq!(*acks.lock(), vec![Err(SioError::AckAbandoned(1))]);

    assert_eq!(within(peer.recv_data()).await.as_deref(), Some("1::/chat"));
    eventually(|| root_reconnects.load(Ordering::SeqCst) == 1).await;
    assert_eq!(chat_reconnects.load(Ordering::SeqCst), 0);

    peer.send("1::/chat");
    eventually(|| chat_reconnects.load(Ordering::SeqCst) == 1).await;

    chat.emit("back");
    assert_eq!(within(peer.recv_data()).await.as_deref(), Some("3::/chat:back"));
}

#[tokio::test]
async fn e2e_endpoint_reports_disconnected_while_stream_is_down() {
    let mut config = common::create_test_config();
    config.reconnect.base_delay_ms = 200;
    config.reconnect.max_delay_ms = 400;
    let mut server = TestServer::with_http(StaticHttp::ok("s:30:60:websocket"), config);
    let (root, peer) = server.connect_root().await;
    let mut states = root.connection().state_receiver();

    server.connector.refuse_next(1);
    drop(peer);

    within(async {
        while *states.borrow_and_update() != ConnectionState::Reconnecting {
            states.changed().await.unwrap();
        }
    })
    .await;
    assert!(!root.is_connected());
    assert!(!root.is_disconnected());

    let _peer = server.accept().await;
    eventually(|| root.is_connected()).await;
}

#[tokio::test]
async fn e2e_exhausted_reconnect_disconnects_with_error() {
    let mut server = TestServer::new("s:30:60:websocket");
    let (root, mut peer) = server.connect_root().await;
    let chat = join(&root, &mut peer, "/chat").await;

    let root_errors = recorder();
    let r = root_errors.clone();
    root.set_disconnect_callback(move |err| r.lock().push(err.cloned()));
    let chat_errors = recorder();
    let c = chat_errors.clone();
    chat.set_disconnect_callback(move |err| c.lock().push(err.cloned()));

    server.connector.refuse_next(10);
    drop(peer);

    eventually(|| !root_errors.lock().is_empty() && !chat_errors.lock().is_empty()).await;
    assert!(matches!(root_errors.lock()[0], Some(SioError::Stream(_))));
    assert_eq!(*root_errors.lock(), *chat_errors.lock());

    // First session stream, then one attempt and two retries.
    assert_eq!(server.connector.opened_urls().len(), 4);
    assert_eq!(root.connection().state(), ConnectionState::Failed);
    assert!(root.is_disconnected() && chat.is_disconnected());
    assert!(server.listener.try_accept().is_none());

    root.disconnect();
    assert_eq!(root_errors.lock().len(), 1);
}
