use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use accord_client::gateway::events::StatusUpdate;
use accord_client::{Config, ConnectionState, Error, Event, Session};

type ServerWs = WebSocketStream<TcpStream>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config(url: &str) -> Config {
    Config {
        token: "A".into(),
        intents: 0,
        shard_id: 0,
        shard_count: 1,
        api_base: "http://127.0.0.1:0".into(),
        gateway_url: Some(url.to_string()),
        sync_dispatch: true,
        max_reconnect_attempts: 3,
        presence: None,
    }
}

async fn bind_gateway() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, format!("ws://127.0.0.1:{port}/gateway"))
}

async fn accept_ws(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn recv_json(ws: &mut ServerWs) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for client message")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_hello(ws: &mut ServerWs, interval_ms: u64) {
    send_json(ws, json!({"op": 10, "d": {"heartbeat_interval": interval_ms}})).await;
}

async fn wait_for_state(session: &Session, want: ConnectionState) {
    for _ in 0..100 {
        if session.state() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session never reached {want:?}, stuck at {:?}", session.state());
}

#[tokio::test]
async fn identify_then_ready() {
    init_tracing();
    let (listener, url) = bind_gateway().await;

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 45_000).await;

        let identify = recv_json(&mut ws).await;
        assert_eq!(identify["op"], 2);
        assert_eq!(identify["d"]["token"], "A");
        assert_eq!(identify["d"]["intents"], 0);

        send_json(
            &mut ws,
            json!({"op": 0, "t": "READY", "s": 1, "d": {"session_id": "S1", "user_id": "U1"}}),
        )
        .await;

        // Hold the connection open until the client closes it.
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let session = Session::new(test_config(&url));
    let connects = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&connects);
    session.add_handler(move |event| {
        if matches!(event, Event::Connect) {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    session.open().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Ready);
    assert_eq!(session.session_id().as_deref(), Some("S1"));
    assert_eq!(session.sequence(), 1);
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    assert!(matches!(
        session.open().await,
        Err(accord_client::Error::AlreadyOpen)
    ));

    session.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn resumes_with_held_session_and_cursor_after_drop() {
    init_tracing();
    let (listener, url) = bind_gateway().await;

    let server = tokio::spawn(async move {
        // First connection: identify, advance the cursor, then vanish.
        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 45_000).await;
        let identify = recv_json(&mut ws).await;
        assert_eq!(identify["op"], 2);
        send_json(
            &mut ws,
            json!({"op": 0, "t": "READY", "s": 1, "d": {"session_id": "S1", "user_id": "U1"}}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"op": 0, "t": "MESSAGE_CREATE", "s": 42, "d": {"content": "hi"}}),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(ws);

        // Reconnect must resume, not re-identify.
        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 45_000).await;
        let resume = recv_json(&mut ws).await;
        assert_eq!(resume["op"], 6);
        assert_eq!(resume["d"]["token"], "A");
        assert_eq!(resume["d"]["session_id"], "S1");
        assert_eq!(resume["d"]["seq"], 42);

        send_json(&mut ws, json!({"op": 0, "t": "RESUMED", "s": 43, "d": {}})).await;
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let session = Session::new(test_config(&url));
    session.open().await.unwrap();

    // Let the dropped-connection path play out: reconnect backoff starts at
    // one second.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(session.sequence(), 42);
    wait_for_state(&session, ConnectionState::Ready).await;
    assert_eq!(session.sequence(), 43);
    assert_eq!(session.session_id().as_deref(), Some("S1"));

    session.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn heartbeats_carry_the_cursor_and_answer_requests() {
    init_tracing();
    let (listener, url) = bind_gateway().await;

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 150).await;
        let identify = recv_json(&mut ws).await;
        assert_eq!(identify["op"], 2);
        send_json(
            &mut ws,
            json!({"op": 0, "t": "READY", "s": 7, "d": {"session_id": "S1", "user_id": "U1"}}),
        )
        .await;

        // Interval-driven heartbeats carry the current cursor. The first
        // tick can race the READY dispatch, so ack each one and wait for a
        // beat that saw the cursor.
        loop {
            let msg = recv_json(&mut ws).await;
            if msg["op"] != 1 {
                continue;
            }
            send_json(&mut ws, json!({"op": 11})).await;
            if msg["d"] == 7 {
                break;
            }
        }

        // An explicit server-side request gets an immediate heartbeat.
        send_json(&mut ws, json!({"op": 1})).await;
        let heartbeat = loop {
            let msg = recv_json(&mut ws).await;
            if msg["op"] == 1 {
                break msg;
            }
        };
        assert_eq!(heartbeat["d"], 7);
        send_json(&mut ws, json!({"op": 11})).await;

        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let session = Session::new(test_config(&url));
    session.open().await.unwrap();

    // Give both heartbeat exchanges time to complete before tearing down.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(session.state(), ConnectionState::Ready);

    session.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn dispatched_events_reach_handlers_in_order() {
    init_tracing();
    let (listener, url) = bind_gateway().await;

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 45_000).await;
        let _ = recv_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"op": 0, "t": "READY", "s": 1, "d": {"session_id": "S1", "user_id": "U1"}}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"op": 0, "t": "MESSAGE_CREATE", "s": 2, "d": {"content": "one"}}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"op": 0, "t": "SOMETHING_NEW", "s": 3, "d": {"x": 1}}),
        )
        .await;

        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let session = Session::new(test_config(&url));
    let (event_tx, event_rx) = std::sync::mpsc::channel::<String>();
    session.add_handler(move |event| {
        let name = match event {
            Event::Connect => "connect".to_string(),
            Event::MessageCreate(_) => "message_create".to_string(),
            Event::Unknown { event_type, .. } => format!("unknown:{event_type}"),
            other => format!("{other:?}"),
        };
        let _ = event_tx.send(name);
    });

    session.open().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(session.sequence(), 3);

    session.close().await.unwrap();
    server.await.unwrap();

    let seen: Vec<String> = event_rx.try_iter().collect();
    assert_eq!(seen[0], "connect");
    assert!(seen.contains(&"message_create".to_string()));
    assert!(seen.contains(&"unknown:SOMETHING_NEW".to_string()));
}

#[tokio::test]
async fn write_queue_preserves_enqueue_order() {
    init_tracing();
    let (listener, url) = bind_gateway().await;

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 45_000).await;
        let _ = recv_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"op": 0, "t": "READY", "s": 1, "d": {"session_id": "S1", "user_id": "U1"}}),
        )
        .await;

        // Presence updates must arrive in enqueue order, with the member
        // request after all of them. Heartbeats may interleave anywhere;
        // ack each so the liveness check stays satisfied.
        let mut since_values = Vec::new();
        loop {
            let msg = recv_json(&mut ws).await;
            match msg["op"].as_u64() {
                Some(1) => send_json(&mut ws, json!({"op": 11})).await,
                Some(3) => since_values.push(msg["d"]["since"].as_u64().unwrap()),
                Some(8) => {
                    assert_eq!(msg["d"]["guild_id"], "G1");
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(since_values, vec![0, 1, 2, 3, 4]);

        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let session = Session::new(test_config(&url));
    session.open().await.unwrap();

    for i in 0..5u64 {
        session
            .update_status(StatusUpdate {
                since: i,
                game: None,
                status: "online".into(),
                afk: false,
            })
            .unwrap();
    }
    session.request_guild_members("G1", "", 0).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    session.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn reconnect_budget_exhaustion_surfaces_terminal_error() {
    init_tracing();
    let (listener, url) = bind_gateway().await;

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 45_000).await;
        let _ = recv_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"op": 0, "t": "READY", "s": 1, "d": {"session_id": "S1", "user_id": "U1"}}),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Drop the connection and the listener: every reconnect attempt
        // must fail until the budget runs out.
        drop(ws);
        drop(listener);
    });

    let mut config = test_config(&url);
    config.max_reconnect_attempts = 1;
    let session = Session::new(config);
    session.open().await.unwrap();
    assert!(session.take_error().is_none());

    wait_for_state(&session, ConnectionState::Disconnected).await;
    assert!(matches!(
        session.take_error(),
        Some(Error::ReconnectExhausted)
    ));
    // Taking the error clears it.
    assert!(session.take_error().is_none());
    server.await.unwrap();
}
