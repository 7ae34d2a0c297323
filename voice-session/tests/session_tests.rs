//! Session lifecycle and message routing against the in-memory transport.

mod common;

use async_trait::async_trait;
use common::{WAIT, chunk_samples, connected, eventually, events, frame, next_event};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use voice_session::transport::{BoxedSink, BoxedSource, Connector, MemoryConnector};
use voice_session::{
    ConnectionState, ErrorKind, EventKind, LiveError, SessionClient, SessionConfig, SessionEvent,
    ToolResponse,
};

/// A connector whose handshake never completes.
struct HangingConnector;

#[async_trait]
impl Connector for HangingConnector {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn connect(&self, _config: &SessionConfig) -> voice_session::Result<(BoxedSink, BoxedSource)> {
        futures::future::pending().await
    }
}

#[tokio::test]
async fn test_send_audio_while_disconnected_is_invalid_state() {
    let (connector, mut peers) = MemoryConnector::new();
    let session = SessionClient::new(Arc::new(connector));

    let err = session.send_audio(frame(1, 320, 0)).unwrap_err();
    assert!(matches!(err, LiveError::InvalidState(_)));

    session.connect(SessionConfig::default()).await.unwrap();
    let mut peer = peers.recv().await.unwrap();
    session.disconnect().await.unwrap();

    let err = session.send_audio(frame(1, 320, 1)).unwrap_err();
    assert!(matches!(err, LiveError::InvalidState(_)));
    let err = session.send_text("hello").await.unwrap_err();
    assert!(matches!(err, LiveError::InvalidState(_)));

    let written = peer.drain();
    assert_eq!(written.len(), 1, "only the setup frame may be written: {written:?}");
    assert!(written[0].contains("\"setup\""));
    assert_eq!(session.stats().frames_sent, 0);
}

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let (connector, _peers) = MemoryConnector::new();
    let session = SessionClient::new(Arc::new(connector));
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let log = log.clone();
        session.on(EventKind::StateChanged, move |event| {
            if let SessionEvent::StateChanged { to, .. } = event {
                log.lock().push(to.to_string());
            }
        });
    }
    {
        let log = log.clone();
        session.on(EventKind::Ready, move |_| log.lock().push("ready".into()));
    }

    session.connect(SessionConfig::default()).await.unwrap();
    session.disconnect().await.unwrap();

    assert_eq!(*log.lock(), vec!["connecting", "connected", "ready", "closing", "disconnected"]);
}

#[tokio::test]
async fn test_reconnect_leaves_no_residual_frames() {
    let (connector, mut peers) = MemoryConnector::new();
    let session = SessionClient::new(Arc::new(connector));

    session.connect(SessionConfig::default()).await.unwrap();
    let _first_peer = peers.recv().await.unwrap();
    for seq in 0..20 {
        session.send_audio(frame(1, 320, seq)).unwrap();
    }
    session.disconnect().await.unwrap();

    session.connect(SessionConfig::default()).await.unwrap();
    let mut peer = peers.recv().await.unwrap();
    assert_eq!(session.outstanding_calls(), Vec::<String>::new());

    // sequence numbering restarts with the new session
    session.send_audio(frame(7, 320, 0)).unwrap();

    let first = peer.recv_json_timeout(WAIT).await.unwrap();
    assert_eq!(first["type"], "setup");
    let chunk = peer.recv_type("audio_chunk", WAIT).await.unwrap();
    assert!(chunk_samples(&chunk).iter().all(|&s| s == 7));
    assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
    assert!(peer.recv_type("audio_chunk", Duration::from_millis(100)).await.is_none());

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_audio_text_and_tool_responses_reach_peer() {
    let (session, mut peer, _peers) = connected(SessionConfig::default()).await;

    session.send_text("one").await.unwrap();
    session.send_text("two").await.unwrap();
    session.send_audio(frame(3, 320, 0)).unwrap();
    session.send_text("three").await.unwrap();

    let mut texts = Vec::new();
    let mut chunks = 0;
    while texts.len() < 3 || chunks < 1 {
        let message = peer.recv_json_timeout(WAIT).await.expect("message");
        match message["type"].as_str() {
            Some("text") => texts.push(message["content"].as_str().unwrap().to_string()),
            Some("audio_chunk") => chunks += 1,
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert_eq!(texts, vec!["one", "two", "three"]);
    assert!(eventually(|| session.stats().frames_sent == 1).await);
}

#[tokio::test]
async fn test_transport_drop_moves_to_error_and_discards_calls() {
    let (session, peer, mut peers) = connected(SessionConfig::default()).await;
    let mut calls = events(&session, EventKind::ToolCall);
    let mut cancelled = events(&session, EventKind::ToolCallsCancelled);
    let mut errors = events(&session, EventKind::Error);

    peer.send_json(&json!({
        "type": "tool_call",
        "calls": [{ "id": "a", "name": "lookup", "args": {} }]
    }))
    .await
    .unwrap();
    next_event(&mut calls).await;
    assert_eq!(session.outstanding_calls(), vec!["a"]);

    drop(peer);

    let SessionEvent::Error { kind, .. } = next_event(&mut errors).await else {
        panic!("expected error event");
    };
    assert_eq!(kind, ErrorKind::Transport);
    assert_eq!(next_event(&mut cancelled).await, SessionEvent::ToolCallsCancelled(vec!["a".into()]));
    assert!(matches!(session.state(), ConnectionState::Error(_)));
    assert!(session.outstanding_calls().is_empty());
    assert!(matches!(session.send_audio(frame(0, 320, 9)), Err(LiveError::InvalidState(_))));

    // answering a discarded call is a no-op
    session.send_tool_response(vec![ToolResponse::new("a", "lookup", json!({}))]).await.unwrap();

    // no automatic reconnect; an explicit one works
    assert!(peers.try_recv().is_err());
    session.connect(SessionConfig::default()).await.unwrap();
    assert!(session.is_connected());
    assert!(peers.recv().await.is_some());
}

#[tokio::test]
async fn test_malformed_inbound_is_dropped_and_session_continues() {
    let (session, peer, _peers) = connected(SessionConfig::default()).await;
    let mut errors = events(&session, EventKind::Error);
    let mut text = events(&session, EventKind::TextDelta);

    peer.send_raw("definitely not json").await.unwrap();
    peer.send_json(&json!({ "type": "mystery" })).await.unwrap();
    peer.send_json(&json!({ "type": "text_delta", "content": "hello" })).await.unwrap();

    for _ in 0..2 {
        let SessionEvent::Error { kind, .. } = next_event(&mut errors).await else {
            panic!("expected error event");
        };
        assert_eq!(kind, ErrorKind::Protocol);
    }
    assert_eq!(next_event(&mut text).await, SessionEvent::TextDelta("hello".into()));
    assert!(session.is_connected());
    assert_eq!(session.stats().protocol_errors, 2);
}

#[tokio::test]
async fn test_unknown_or_repeated_tool_response_is_noop() {
    let (session, mut peer, _peers) = connected(SessionConfig::default()).await;
    let mut calls = events(&session, EventKind::ToolCall);

    session.send_tool_response(vec![ToolResponse::new("zzz", "ghost", json!({}))]).await.unwrap();
    assert!(peer.recv_type("tool_response", Duration::from_millis(100)).await.is_none());

    peer.send_json(&json!({
        "type": "tool_call",
        "calls": [{ "id": "a", "name": "lookup", "args": { "q": 1 } }]
    }))
    .await
    .unwrap();
    next_event(&mut calls).await;

    session.send_tool_response(vec![ToolResponse::new("a", "", json!({ "success": true }))]).await.unwrap();
    session.send_tool_response(vec![ToolResponse::new("a", "", json!({ "success": true }))]).await.unwrap();

    let response = peer.recv_type("tool_response", WAIT).await.unwrap();
    assert_eq!(response["responses"][0]["id"], "a");
    assert_eq!(response["responses"][0]["name"], "lookup");
    assert!(peer.recv_type("tool_response", Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_peer_cancellation_retires_calls() {
    let (session, peer, _peers) = connected(SessionConfig::default()).await;
    let mut cancelled = events(&session, EventKind::ToolCallsCancelled);

    peer.send_json(&json!({
        "type": "tool_call",
        "calls": [
            { "id": "a", "name": "lookup", "args": {} },
            { "id": "b", "name": "lookup", "args": {} }
        ]
    }))
    .await
    .unwrap();
    peer.send_json(&json!({ "type": "tool_call_cancellation", "ids": ["a", "unknown"] })).await.unwrap();

    assert_eq!(next_event(&mut cancelled).await, SessionEvent::ToolCallsCancelled(vec!["a".into()]));
    assert_eq!(session.outstanding_calls(), vec!["b"]);
}

#[tokio::test]
async fn test_inbound_audio_and_signals_are_published() {
    let (session, peer, _peers) = connected(SessionConfig::default()).await;
    let mut audio = events(&session, EventKind::AudioReceived);
    let mut grounding = events(&session, EventKind::Grounding);
    let mut turns = events(&session, EventKind::TurnComplete);
    let mut errors = events(&session, EventKind::Error);

    let pcm = voice_session::AudioFrame::new(vec![5; 320], 16_000, 0).to_base64();
    peer.send_json(&json!({ "type": "audio_chunk", "payload": pcm, "mimeType": "audio/pcm;rate=16000" }))
        .await
        .unwrap();
    peer.send_json(&json!({ "type": "audio_chunk", "payload": pcm })).await.unwrap();
    peer.send_json(&json!({ "type": "grounding", "query": "weather in Nairobi" })).await.unwrap();
    peer.send_json(&json!({ "type": "turn_complete" })).await.unwrap();
    peer.send_json(&json!({ "type": "error", "reason": "quota exceeded" })).await.unwrap();

    let SessionEvent::AudioReceived(first) = next_event(&mut audio).await else { panic!() };
    assert_eq!((first.sample_rate(), first.sequence(), first.len()), (16_000, 0, 320));
    let SessionEvent::AudioReceived(second) = next_event(&mut audio).await else { panic!() };
    assert_eq!((second.sample_rate(), second.sequence()), (24_000, 1));

    assert_eq!(
        next_event(&mut grounding).await,
        SessionEvent::Grounding { query: "weather in Nairobi".into() }
    );
    assert_eq!(next_event(&mut turns).await, SessionEvent::TurnComplete);
    assert_eq!(
        next_event(&mut errors).await,
        SessionEvent::Error { kind: ErrorKind::Remote, message: "quota exceeded".into() }
    );
    assert_eq!(session.stats().frames_received, 2);
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_connect_timeout_reverts_to_disconnected() {
    let session = SessionClient::new(Arc::new(HangingConnector));
    let config = SessionConfig::builder().connect_timeout(Duration::from_millis(50)).build().unwrap();

    let err = session.connect(config).await.unwrap_err();
    assert!(matches!(err, LiveError::ConnectError(_)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_aborts_pending_connect() {
    let session = SessionClient::new(Arc::new(HangingConnector));
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(SessionConfig::default()).await })
    };
    assert!(eventually(|| session.state() == ConnectionState::Connecting).await);

    session.disconnect().await.unwrap();
    let result = tokio::time::timeout(WAIT, connecting).await.unwrap().unwrap();
    assert!(matches!(result, Err(LiveError::InvalidState(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_invalid_tool_schema_fails_connect() {
    let (connector, _peers) = MemoryConnector::new();
    let session = SessionClient::new(Arc::new(connector));
    let config = SessionConfig::default()
        .with_tool(voice_session::ToolDeclaration::new("broken").with_parameters(json!({ "type": 12 })));

    let err = session.connect(config).await.unwrap_err();
    assert!(matches!(err, LiveError::ConfigError(_)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}
