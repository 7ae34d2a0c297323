//! Gap-free playback of inbound speech.
//!
//! Frames received from the session go into a bounded SPSC ring (`rtrb`). A
//! playback clock task drains one frame at a time to the output device and
//! sleeps for the frame's duration; when the ring is empty it writes silence
//! instead and reports the underrun. An `interrupted` message from the peer
//! flushes the ring synchronously on the network path, so nothing buffered
//! before the interruption reaches the speaker after it. The ring is also
//! flushed whenever the session leaves `Connected`.

use crate::audio::{AudioFrame, Resampler, f32_to_i16, i16_to_f32};
use crate::config::PlaybackConfig;
use crate::device::{AudioOutput, OutputStream};
use crate::error::{LiveError, Result};
use crate::events::{EventKind, SessionEvent, SubscriptionId};
use crate::session::{ConnectionState, SessionClient, WeakSessionClient};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Schedules inbound audio frames onto an output device.
pub struct PlaybackEngine {
    shared: Arc<PlaybackShared>,
    running: Mutex<Option<Running>>,
    subscriptions: Vec<SubscriptionId>,
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct PlaybackShared {
    producer: Mutex<rtrb::Producer<AudioFrame>>,
    consumer: Mutex<rtrb::Consumer<AudioFrame>>,
    config: PlaybackConfig,
    session: WeakSessionClient,
}

impl PlaybackShared {
    fn enqueue(&self, frame: AudioFrame) -> Result<()> {
        let sequence = frame.sequence();
        self.producer.lock().push(frame).map_err(|_| {
            LiveError::BufferFull(format!(
                "playback ring full ({} frames), dropped frame {}",
                self.config.capacity, sequence
            ))
        })
    }

    fn flush(&self) -> usize {
        let discarded = {
            let mut consumer = self.consumer.lock();
            let mut discarded = 0;
            while consumer.pop().is_ok() {
                discarded += 1;
            }
            discarded
        };
        tracing::debug!(frames = discarded, "Playback flushed");
        self.publish(SessionEvent::PlaybackFlushed { frames: discarded });
        discarded
    }

    fn len(&self) -> usize {
        self.consumer.lock().slots()
    }

    fn next_frame(&self) -> Option<AudioFrame> {
        self.consumer.lock().pop().ok()
    }

    fn publish(&self, event: SessionEvent) {
        if let Some(session) = self.session.upgrade() {
            session.publish(event);
        }
    }

    fn report(&self, error: &LiveError) {
        tracing::warn!(error = %error, "Playback fault");
        self.publish(SessionEvent::from_error(error));
    }
}

impl PlaybackEngine {
    /// Create an engine fed by `session`'s inbound audio and flushed by its
    /// interruptions. The clock does not run until [`start`](Self::start).
    pub fn new(session: &SessionClient, config: PlaybackConfig) -> Result<Self> {
        config.validate()?;
        let (producer, consumer) = rtrb::RingBuffer::new(config.capacity);
        let shared = Arc::new(PlaybackShared {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            config,
            session: session.downgrade(),
        });

        let on_audio = {
            let shared = shared.clone();
            session.on(EventKind::AudioReceived, move |event| {
                if let SessionEvent::AudioReceived(frame) = event {
                    if let Err(error) = shared.enqueue(frame.clone()) {
                        shared.report(&error);
                    }
                }
            })
        };
        let on_interrupt = {
            let shared = shared.clone();
            session.on(EventKind::Interrupted, move |_| {
                shared.flush();
            })
        };

        let on_state = {
            let shared = shared.clone();
            session.on(EventKind::StateChanged, move |event| {
                // speech buffered for a session never outlives it
                if let SessionEvent::StateChanged { from: ConnectionState::Connected, .. } = event {
                    shared.flush();
                }
            })
        };

        Ok(Self {
            shared,
            running: Mutex::new(None),
            subscriptions: vec![on_audio, on_interrupt, on_state],
        })
    }

    /// Append a frame. Fails with `BufferFull` when the ring has no room.
    pub fn enqueue(&self, frame: AudioFrame) -> Result<()> {
        self.shared.enqueue(frame)
    }

    /// Take the next frame, for embedders that drive output from their own
    /// audio callback instead of [`start`](Self::start).
    pub fn pop(&self) -> Option<AudioFrame> {
        self.shared.next_frame()
    }

    /// Discard every buffered frame, returning how many were dropped.
    pub fn flush(&self) -> usize {
        self.shared.flush()
    }

    /// Frames waiting to be played.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// Whether nothing is waiting to be played.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ring capacity in frames.
    pub fn capacity(&self) -> usize {
        self.shared.config.capacity
    }

    /// Whether the playback clock is running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Open `output` and start the playback clock. No-op if already running.
    pub fn start(&self, output: &dyn AudioOutput) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let stream = output.open(self.shared.config.format)?;
        tracing::info!(device = output.name(), sample_rate = self.shared.config.format.sample_rate, "Playback started");

        let token = CancellationToken::new();
        let clock = PlaybackClock::new(self.shared.clone(), stream);
        let task = tokio::spawn(clock.run(token.clone()));
        *running = Some(Running { token, task });
        Ok(())
    }

    /// Stop the clock and release the device. Safe to call repeatedly.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.token.cancel();
        if running.task.await.is_err() {
            tracing::warn!("Playback clock ended abnormally");
        }
        tracing::info!("Playback stopped");
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.token.cancel();
        }
        if let Some(session) = self.shared.session.upgrade() {
            for id in &self.subscriptions {
                session.off(*id);
            }
        }
    }
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("buffered", &self.len())
            .field("capacity", &self.capacity())
            .field("running", &self.is_running())
            .finish()
    }
}

/// The real-time loop: one frame (or one block of silence) per step.
struct PlaybackClock {
    shared: Arc<PlaybackShared>,
    stream: Box<dyn OutputStream>,
    converter: Option<Resampler>,
    silence: Vec<i16>,
    starved: bool,
}

impl PlaybackClock {
    fn new(shared: Arc<PlaybackShared>, stream: Box<dyn OutputStream>) -> Self {
        let silence_len = shared.config.format.samples_for(shared.config.silence()).max(1);
        Self { shared, stream, converter: None, silence: vec![0; silence_len], starved: true }
    }

    async fn run(mut self, token: CancellationToken) {
        let mut deadline = Instant::now();
        loop {
            let played = self.step();
            deadline += played;
            let now = Instant::now();
            if deadline < now {
                // fell behind; resync instead of bursting to catch up
                deadline = now;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Write the next frame or a block of silence; returns the audio time written.
    fn step(&mut self) -> Duration {
        let rate = self.shared.config.format.sample_rate;
        let samples = match self.shared.next_frame() {
            Some(frame) => {
                self.starved = false;
                match self.convert(frame) {
                    Ok(samples) => samples,
                    Err(error) => {
                        self.shared.report(&error);
                        return self.shared.config.silence();
                    }
                }
            }
            None => {
                if !self.starved {
                    self.starved = true;
                    let inserted_ms = self.shared.config.silence_ms;
                    tracing::warn!(inserted_ms, "Playback underrun, inserting silence");
                    self.shared.publish(SessionEvent::Underrun { inserted_ms });
                }
                self.silence.clone()
            }
        };

        if samples.is_empty() {
            // resampler is still filling its first block
            return self.shared.config.silence();
        }
        if let Err(error) = self.stream.write(&samples) {
            self.shared.report(&error);
        }
        Duration::from_micros(samples.len() as u64 * 1_000_000 / u64::from(rate))
    }

    fn convert(&mut self, frame: AudioFrame) -> Result<Vec<i16>> {
        let target = self.shared.config.format.sample_rate;
        if frame.sample_rate() == target {
            return Ok(frame.into_samples());
        }
        let needs_new = self.converter.as_ref().is_none_or(|c| c.from_rate() != frame.sample_rate());
        if needs_new {
            tracing::debug!(from = frame.sample_rate(), to = target, "Resampling playback audio");
            self.converter = Some(Resampler::new(frame.sample_rate(), target, frame.len().max(1))?);
        }
        let Some(converter) = self.converter.as_mut() else {
            return Ok(Vec::new());
        };
        let input: Vec<f32> = frame.samples().iter().copied().map(i16_to_f32).collect();
        let mut output = Vec::with_capacity(input.len() * target as usize / frame.sample_rate() as usize + 1);
        converter.process(&input, &mut output)?;
        Ok(output.into_iter().map(f32_to_i16).collect())
    }
}
