//! Outbound path: the drop-oldest audio queue and the writer task.

use crate::audio::AudioFrame;
use crate::error::{LiveError, Result};
use crate::protocol::OutboundMessage;
use crate::transport::BoxedSink;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

/// Grace period for the close frame when a session shuts down.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Per-session traffic counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) frames_sent: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) protocol_errors: AtomicU64,
}

impl Counters {
    pub(crate) fn reset(&self) {
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.frames_received.store(0, Ordering::Relaxed);
        self.protocol_errors.store(0, Ordering::Relaxed);
    }
}

/// Bounded FIFO of unsent microphone frames.
///
/// When full, the oldest frame is discarded so capture never waits on the
/// network.
#[derive(Debug)]
pub(crate) struct AudioQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    notify: Notify,
}

impl AudioQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Append a frame, returning how many stale frames were dropped to make room.
    pub(crate) fn push(&self, frame: AudioFrame) -> usize {
        let dropped = {
            let mut frames = self.frames.lock();
            let mut dropped = 0;
            while frames.len() >= self.capacity {
                frames.pop_front();
                dropped += 1;
            }
            frames.push_back(frame);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    pub(crate) fn pop(&self) -> Option<AudioFrame> {
        self.frames.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub(crate) fn clear(&self) -> usize {
        let mut frames = self.frames.lock();
        let len = frames.len();
        frames.clear();
        len
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

/// Drains control messages and queued audio into the transport sink.
///
/// Control messages (setup, text, tool responses) keep their submission order;
/// audio is interleaved between them with no ordering guarantee.
pub(crate) struct Writer {
    pub(crate) sink: BoxedSink,
    pub(crate) control: mpsc::Receiver<OutboundMessage>,
    pub(crate) audio: Arc<AudioQueue>,
    pub(crate) token: CancellationToken,
    pub(crate) write_timeout: Duration,
    pub(crate) counters: Arc<Counters>,
}

impl Writer {
    /// Run until cancelled (`Ok`) or until a write fails (`Err`).
    pub(crate) async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    self.audio.clear();
                    if tokio::time::timeout(CLOSE_GRACE, self.sink.close()).await.is_err() {
                        tracing::debug!("Close frame not acknowledged within grace period");
                    }
                    return Ok(());
                }
                message = self.control.recv() => match message {
                    Some(message) => self.write(&message).await?,
                    None => return Ok(()),
                },
                _ = self.audio.notified() => self.drain_audio().await?,
            }
        }
    }

    async fn drain_audio(&mut self) -> Result<()> {
        while !self.token.is_cancelled() {
            let Some(frame) = self.audio.pop() else {
                break;
            };
            self.write(&OutboundMessage::audio(&frame)).await?;
            self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
            if !self.control.is_empty() {
                // let queued control messages through, then resume
                self.audio.notify.notify_one();
                break;
            }
        }
        Ok(())
    }

    async fn write(&mut self, message: &OutboundMessage) -> Result<()> {
        let frame = message.encode()?;
        tracing::trace!(message_type = message.type_name(), bytes = frame.len(), "Writing frame");
        match tokio::time::timeout(self.write_timeout, self.sink.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(LiveError::Timeout(format!(
                "write of {} stalled for {} ms",
                message.type_name(),
                self.write_timeout.as_millis()
            ))),
        }
    }
}
