//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use voice_session::transport::{MemoryConnector, MemoryPeer};
use voice_session::{AudioFrame, EventKind, SessionClient, SessionConfig, SessionEvent};

/// Generous upper bound for anything that should happen promptly.
pub const WAIT: Duration = Duration::from_secs(2);

/// A connected session plus the remote end of its connection, with the setup
/// frame already consumed.
pub async fn connected(config: SessionConfig) -> (SessionClient, MemoryPeer, mpsc::Receiver<MemoryPeer>) {
    let (connector, mut peers) = MemoryConnector::new();
    let session = SessionClient::new(Arc::new(connector));
    session.connect(config).await.expect("connect");
    let mut peer = peers.recv().await.expect("peer");
    let setup = peer.recv_type("setup", WAIT).await.expect("setup frame");
    assert_eq!(setup["type"], "setup");
    (session, peer, peers)
}

/// Forward every event of `kind` into a channel.
pub fn events(session: &SessionClient, kind: EventKind) -> mpsc::UnboundedReceiver<SessionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    session.on(kind, move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

/// Next event from `rx`, failing the test if none arrives in time.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// A frame of `len` samples all equal to `value`.
pub fn frame(value: i16, len: usize, sequence: u64) -> AudioFrame {
    AudioFrame::new(vec![value; len], 16_000, sequence)
}

/// Decode the samples of an `audio_chunk` JSON message.
pub fn chunk_samples(message: &serde_json::Value) -> Vec<i16> {
    let payload = message["payload"].as_str().expect("payload");
    AudioFrame::from_base64(payload, 16_000, 0).expect("pcm payload").into_samples()
}

/// Poll `condition` until it holds or `WAIT` elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
