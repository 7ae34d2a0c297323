//! In-process transport.
//!
//! Every successful [`MemoryConnector::connect`] hands a [`MemoryPeer`] to the
//! owner of the connector, who plays the remote service: it reads what the
//! client wrote and injects inbound frames. Dropping the peer looks like a
//! transport drop to the client.

use super::{BoxedSink, BoxedSource, Connector, FrameSink, FrameSource};
use crate::config::SessionConfig;
use crate::error::{LiveError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

const PEER_QUEUE: usize = 8;
const FRAME_QUEUE: usize = 256;

/// Connector producing in-process connections.
pub struct MemoryConnector {
    peers: mpsc::Sender<MemoryPeer>,
    fail_next: Mutex<Option<String>>,
}

impl MemoryConnector {
    /// Create a connector and the receiver on which its peers are delivered.
    pub fn new() -> (Self, mpsc::Receiver<MemoryPeer>) {
        let (peers, rx) = mpsc::channel(PEER_QUEUE);
        (Self { peers, fail_next: Mutex::new(None) }, rx)
    }

    /// Make the next handshake fail with `reason`.
    pub fn fail_next(&self, reason: impl Into<String>) {
        *self.fail_next.lock() = Some(reason.into());
    }
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, _config: &SessionConfig) -> Result<(BoxedSink, BoxedSource)> {
        if let Some(reason) = self.fail_next.lock().take() {
            return Err(LiveError::connect(reason));
        }

        let (client_tx, peer_rx) = mpsc::channel(FRAME_QUEUE);
        let (peer_tx, client_rx) = mpsc::channel(FRAME_QUEUE);

        self.peers
            .try_send(MemoryPeer { outbound: peer_rx, inbound: peer_tx })
            .map_err(|_| LiveError::connect("no remote peer is accepting connections"))?;

        Ok((Box::new(MemorySink { tx: Some(client_tx) }), Box::new(MemorySource { rx: client_rx })))
    }
}

/// The remote end of an in-process connection.
#[derive(Debug)]
pub struct MemoryPeer {
    outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<String>,
}

impl MemoryPeer {
    /// Next raw frame written by the client; `None` once it closed.
    pub async fn recv_raw(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Next frame written by the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let raw = self.outbound.recv().await?;
        serde_json::from_str(&raw).ok()
    }

    /// Like [`recv_json`](Self::recv_json) but gives up after `wait`.
    pub async fn recv_json_timeout(&mut self, wait: Duration) -> Option<Value> {
        tokio::time::timeout(wait, self.recv_json()).await.ok().flatten()
    }

    /// Skip frames until one of the given `type` arrives.
    pub async fn recv_type(&mut self, message_type: &str, wait: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let value = self.recv_json_timeout(remaining).await?;
            if value.get("type").and_then(Value::as_str) == Some(message_type) {
                return Some(value);
            }
        }
    }

    /// Frames already written by the client, without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Inject a raw inbound frame.
    pub async fn send_raw(&self, frame: impl Into<String>) -> Result<()> {
        self.inbound
            .send(frame.into())
            .await
            .map_err(|_| LiveError::transport("client side of the connection is gone"))
    }

    /// Inject an inbound JSON message.
    pub async fn send_json(&self, value: &Value) -> Result<()> {
        self.send_raw(value.to_string()).await
    }
}

struct MemorySink {
    tx: Option<mpsc::Sender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| LiveError::transport("connection closed"))?;
        tx.send(frame).await.map_err(|_| LiveError::transport("remote peer went away"))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::Receiver<String>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }
}
