//! End-to-end tests driving a full connector against loopback WebSocket
//! servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::LinkConfig;
use crate::connection::{ConnectionEvent, ConnectionState, Connector, MediaState};
use crate::error::LinkError;
use crate::media::{AudioCapture, CaptureFactory};
use crate::protocol::{ContentKind, Role};

type ServerWs = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

/// Opt-in log output for debugging test failures: RUST_LOG=convo_link=debug.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Bind a loopback listener, accept one WebSocket connection and hand it to
/// `handler`.
async fn one_shot_server<F, Fut>(handler: F) -> SocketAddr
where
    F: FnOnce(ServerWs) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        handler(ws).await;
    });
    addr
}

/// Bind a loopback listener whose port is then released, so connects are
/// refused.
async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn establish(ws: &mut ServerWs, session: &str) {
    let frame = format!(r#"{{"type":"session-established","connection_id":"{session}"}}"#);
    ws.send(WsMessage::Text(frame.into())).await.unwrap();
}

async fn hold_until_close(mut ws: ServerWs) {
    while let Some(Ok(msg)) = ws.next().await {
        if msg.is_close() {
            break;
        }
    }
}

fn test_config(addr: SocketAddr) -> LinkConfig {
    let mut cfg = LinkConfig::new(format!("ws://{addr}"), "http://127.0.0.1:1/voice");
    cfg.auto_reconnect = false;
    cfg.switch_grace_ms = 50;
    cfg
}

fn test_capture_factory() -> CaptureFactory {
    Arc::new(|| {
        let (tx, rx) = mpsc::channel(8);
        // The sender lives inside the release hook so the source stays open
        // until the session tears it down.
        Ok(AudioCapture::with_release(rx, move || drop(tx)))
    })
}

async fn next_event(rx: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for connection event")
        .expect("event stream closed")
}

#[tokio::test]
async fn send_transparently_connects_and_tags_active_thread() {
    let (frame_tx, frame_rx) = oneshot::channel();
    let addr = one_shot_server(move |mut ws| async move {
        // Session identifier arrives late; the send must wait for it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        establish(&mut ws, "s1").await;
        while let Some(Ok(msg)) = ws.next().await {
            if let WsMessage::Text(text) = msg {
                let _ = frame_tx.send(text.as_str().to_owned());
                break;
            }
        }
    })
    .await;

    let connector = Connector::builder(test_config(addr)).spawn();
    connector.set_active_thread(Some("t1".into())).await;
    let id = connector.send_text("hello there", None).await.unwrap();

    let raw = timeout(Duration::from_secs(5), frame_rx)
        .await
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["type"], "chat");
    assert_eq!(value["message"], "hello there");
    assert_eq!(value["thread_id"], "t1");
    assert_eq!(value["id"], id.as_str());

    connector.disconnect().await;
}

#[tokio::test]
async fn fresh_unscoped_channel_sends_client_config() {
    let (frame_tx, frame_rx) = oneshot::channel();
    let addr = one_shot_server(move |mut ws| async move {
        establish(&mut ws, "s1").await;
        while let Some(Ok(msg)) = ws.next().await {
            if let WsMessage::Text(text) = msg {
                let _ = frame_tx.send(text.as_str().to_owned());
                break;
            }
        }
    })
    .await;

    let mut cfg = test_config(addr);
    cfg.client_config = Some(serde_json::json!({"locale": "en-US"}));
    let connector = Connector::builder(cfg).spawn();
    connector.connect().await.unwrap();

    let raw = timeout(Duration::from_secs(5), frame_rx)
        .await
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["type"], "client-config");
    assert_eq!(value["client"], "convo_link");
    assert_eq!(value["locale"], "en-US");

    connector.disconnect().await;
}

#[tokio::test]
async fn connect_failure_is_typed_not_hung() {
    let addr = refused_addr().await;
    let connector = Connector::builder(test_config(addr)).spawn();

    let err = timeout(Duration::from_secs(5), connector.connect())
        .await
        .expect("connect must resolve")
        .unwrap_err();
    assert!(matches!(err, LinkError::Transport(_)));
    assert!(err.is_reconnectable());
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let addr = one_shot_server(|mut ws| async move {
        establish(&mut ws, "s1").await;
        hold_until_close(ws).await;
    })
    .await;

    let connector = Connector::builder(test_config(addr)).spawn();
    let mut events = connector.subscribe();
    connector.connect().await.unwrap();
    connector.disconnect().await;
    connector.disconnect().await;
    connector.disconnect().await;

    let mut disconnected = 0;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(300), events.recv()).await {
        if matches!(
            event,
            ConnectionEvent::StateChanged(ConnectionState::Disconnected)
        ) {
            disconnected += 1;
        }
    }
    assert_eq!(disconnected, 1);

    let status = connector.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(status.session_id.is_none());
}

#[tokio::test]
async fn reconnect_attempts_are_bounded() {
    let addr = refused_addr().await;

    let mut cfg = LinkConfig::new(format!("ws://{addr}"), "http://127.0.0.1:1/voice");
    cfg.reconnect_interval_ms = 50;
    cfg.max_reconnect_attempts = 2;
    let connector = Connector::builder(cfg).spawn();
    let mut events = connector.subscribe();

    assert!(connector.connect().await.is_err());

    // Let the bounded retries run out.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = connector.status().await.unwrap();
    assert_eq!(status.reconnect_attempts, 2);
    assert_eq!(status.state, ConnectionState::Error);

    // One transport error per attempt: the initial connect plus two retries.
    let mut errors = 0;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        if matches!(event, ConnectionEvent::Error(_)) {
            errors += 1;
        }
    }
    assert_eq!(errors, 3);
}

#[tokio::test]
async fn token_stream_reassembles_into_final_message() {
    init_tracing();
    let addr = one_shot_server(|mut ws| async move {
        establish(&mut ws, "s1").await;
        for frame in [
            r#"{"type":"token-chunk","id":"m1","content":"Hel"}"#,
            r#"{"type":"token-chunk","id":"m1","content":"lo"}"#,
            r#"{"type":"stream-done","id":"m1"}"#,
        ] {
            ws.send(WsMessage::Text(frame.into())).await.unwrap();
        }
        hold_until_close(ws).await;
    })
    .await;

    let connector = Connector::builder(test_config(addr)).spawn();
    let mut events = connector.subscribe();
    connector.connect().await.unwrap();

    let (id, chunk, kind) = loop {
        if let ConnectionEvent::StreamStarted { id, chunk, kind } = next_event(&mut events).await {
            break (id, chunk, kind);
        }
    };
    assert_eq!(id, "m1");
    assert_eq!(chunk, "Hel");
    assert_eq!(kind, ContentKind::Markup);

    match next_event(&mut events).await {
        ConnectionEvent::StreamChunk { accumulated, .. } => assert_eq!(accumulated, "Hello"),
        other => panic!("expected stream chunk, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::StreamDone { .. }
    ));
    match next_event(&mut events).await {
        ConnectionEvent::MessageReceived(message) => {
            assert_eq!(message.content, "Hello");
            assert_eq!(message.kind, ContentKind::Markup);
            assert_eq!(message.role, Role::Assistant);
        }
        other => panic!("expected final message, got {other:?}"),
    }

    connector.disconnect().await;
}

#[tokio::test]
async fn thread_switch_reacquires_session_on_scoped_channel() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for session in ["s1", "s2"] {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            establish(&mut ws, session).await;
            hold_until_close(ws).await;
        }
    });

    let connector = Connector::builder(test_config(addr)).spawn();
    let mut events = connector.subscribe();
    connector.connect().await.unwrap();
    connector.switch_thread("t2").await.unwrap();

    let status = connector.status().await.unwrap();
    assert_eq!(status.active_thread.as_deref(), Some("t2"));
    assert_eq!(status.session_id.as_deref(), Some("s2"));

    let mut saw_changing = false;
    let mut saw_changed = false;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(300), events.recv()).await {
        match event {
            ConnectionEvent::ThreadChanging { to, .. } => {
                assert_eq!(to, "t2");
                saw_changing = true;
            }
            ConnectionEvent::ThreadChanged { thread_id } => {
                assert_eq!(thread_id, "t2");
                saw_changed = true;
            }
            _ => {}
        }
    }
    assert!(saw_changing);
    assert!(saw_changed);

    connector.disconnect().await;
}

#[tokio::test]
async fn unexpected_server_close_clears_session() {
    let addr = one_shot_server(|mut ws| async move {
        establish(&mut ws, "s1").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = ws.close(None).await;
    })
    .await;

    let connector = Connector::builder(test_config(addr)).spawn();
    let mut events = connector.subscribe();
    connector.connect().await.unwrap();

    loop {
        if matches!(
            next_event(&mut events).await,
            ConnectionEvent::StateChanged(ConnectionState::Disconnected)
        ) {
            break;
        }
    }
    let status = connector.status().await.unwrap();
    assert!(status.session_id.is_none());
    assert_eq!(status.state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnects_cleanly_after_server_announced_disconnect() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            establish(&mut ws, "s1").await;
            let frame =
                r#"{"type":"session-state","state":"disconnecting","message":"maintenance"}"#;
            ws.send(WsMessage::Text(frame.into())).await.unwrap();
            // The server announces the end but leaves its side open; the
            // client is the one that must close and recover.
            hold_until_close(ws).await;
        }
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        establish(&mut ws, "s2").await;
        hold_until_close(ws).await;
    });

    let connector = Connector::builder(test_config(addr)).spawn();
    let mut events = connector.subscribe();
    connector.connect().await.unwrap();

    loop {
        if matches!(
            next_event(&mut events).await,
            ConnectionEvent::StateChanged(ConnectionState::Disconnected)
        ) {
            break;
        }
    }

    // Reconnecting right away must converge even if the old socket is still
    // draining.
    connector.connect().await.unwrap();
    loop {
        if let ConnectionEvent::SessionEstablished { session_id } = next_event(&mut events).await {
            if session_id == "s2" {
                break;
            }
        }
    }
    assert_eq!(
        connector.status().await.unwrap().session_id.as_deref(),
        Some("s2")
    );

    connector.disconnect().await;
}

#[tokio::test]
async fn abandoned_queued_send_is_not_transmitted() {
    let (frame_tx, frame_rx) = oneshot::channel();
    let addr = one_shot_server(move |mut ws| async move {
        // Withhold the session identifier long enough for the first caller
        // to give up on its queued send.
        tokio::time::sleep(Duration::from_millis(400)).await;
        establish(&mut ws, "s1").await;
        while let Some(Ok(msg)) = ws.next().await {
            if let WsMessage::Text(text) = msg {
                let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                if value["type"] == "chat" {
                    let message = value["message"].as_str().unwrap_or_default().to_owned();
                    let _ = frame_tx.send(message);
                    break;
                }
            }
        }
    })
    .await;

    let connector = Connector::builder(test_config(addr)).spawn();
    let mut events = connector.subscribe();

    let abandoned = connector.send_text("stale", None);
    assert!(timeout(Duration::from_millis(100), abandoned).await.is_err());

    loop {
        if matches!(
            next_event(&mut events).await,
            ConnectionEvent::SessionEstablished { .. }
        ) {
            break;
        }
    }
    connector.send_text("fresh", None).await.unwrap();

    // The abandoned frame must never reach the wire.
    let first = timeout(Duration::from_secs(5), frame_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, "fresh");

    connector.disconnect().await;
}

#[tokio::test]
async fn start_media_with_unreachable_backend_is_typed_error() {
    let addr = refused_addr().await;

    let connector = Connector::builder(test_config(addr))
        .capture(test_capture_factory())
        .spawn();

    let err = timeout(Duration::from_secs(10), connector.start_media(None))
        .await
        .expect("start_media must resolve")
        .unwrap_err();
    assert!(matches!(
        err,
        LinkError::Transport(_) | LinkError::Timeout(_)
    ));
    assert_eq!(
        connector.status().await.unwrap().media_state,
        MediaState::Idle
    );
}

#[tokio::test]
async fn failed_media_negotiation_releases_capture_and_stays_idle() {
    init_tracing();
    let addr = one_shot_server(|mut ws| async move {
        establish(&mut ws, "s1").await;
        hold_until_close(ws).await;
    })
    .await;

    // Signaling works; the media offer/answer endpoint refuses connections.
    let mut cfg = test_config(addr);
    cfg.connect_timeout_secs = 5;

    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let factory: CaptureFactory = Arc::new(move || {
        let flag = flag.clone();
        let (tx, rx) = mpsc::channel(8);
        Ok(AudioCapture::with_release(rx, move || {
            drop(tx);
            flag.store(true, Ordering::SeqCst);
        }))
    });

    let connector = Connector::builder(cfg).capture(factory).spawn();
    connector.connect().await.unwrap();

    let err = connector.start_media(None).await.unwrap_err();
    assert!(matches!(
        err,
        LinkError::Server(_) | LinkError::Transport(_) | LinkError::Timeout(_)
    ));
    assert_eq!(
        connector.status().await.unwrap().media_state,
        MediaState::Idle
    );

    // The capture pump is cancelled on rollback; its drop releases the
    // device.
    for _ in 0..50 {
        if released.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(released.load(Ordering::SeqCst));

    connector.disconnect().await;
}
