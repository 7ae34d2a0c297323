//! Microphone capture.
//!
//! Every tick the engine drains the input device, publishes the tick's level
//! and converts the samples to wire format (mono, PCM16, target rate) in
//! fixed-length frames. Complete frames are published and, while the session
//! is connected, queued for transmission. Muting drops complete frames only,
//! so a frame is never cut in half; metering continues while muted.

use crate::audio::{AudioFormat, AudioFrame, Resampler, VolumeSample, downmix, f32_to_i16};
use crate::config::CaptureConfig;
use crate::device::{AudioInput, InputStream};
use crate::error::{LiveError, Result};
use crate::events::SessionEvent;
use crate::session::SessionClient;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Converts raw device input into wire-format frames.
///
/// Stateful: resampler history and partial frames carry over between ticks.
#[derive(Debug)]
pub struct CapturePipeline {
    source: AudioFormat,
    target: AudioFormat,
    frame_len: usize,
    resampler: Resampler,
    pending: Vec<f32>,
}

impl CapturePipeline {
    /// Build a pipeline for a device producing `source`.
    pub fn new(source: AudioFormat, config: &CaptureConfig) -> Result<Self> {
        config.validate()?;
        if source.channels == 0 {
            return Err(LiveError::audio("input device reports zero channels"));
        }
        let block = source.samples_for(config.tick()).max(1);
        let resampler = Resampler::new(source.sample_rate, config.target_format.sample_rate, block)?;
        Ok(Self {
            source,
            target: config.target_format,
            frame_len: config.frame_len(),
            resampler,
            pending: Vec::new(),
        })
    }

    /// Samples per output frame.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Wire format of produced frames.
    pub fn target(&self) -> AudioFormat {
        self.target
    }

    /// Process one tick of interleaved input. Returns the tick's level and the
    /// samples of every frame completed by it.
    pub fn process(&mut self, raw: &[f32]) -> Result<(VolumeSample, Vec<Vec<i16>>)> {
        let mono = downmix(raw, self.source.channels);
        let volume = VolumeSample::from_samples(&mono);

        self.resampler.process(&mono, &mut self.pending)?;
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let frame: Vec<i16> = self.pending.drain(..self.frame_len).map(f32_to_i16).collect();
            frames.push(frame);
        }
        Ok((volume, frames))
    }
}

/// Captures microphone audio for a session.
pub struct CaptureEngine {
    shared: Arc<CaptureShared>,
    running: Mutex<Option<Running>>,
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct CaptureShared {
    session: SessionClient,
    config: CaptureConfig,
    muted: AtomicBool,
    next_sequence: AtomicU64,
}

impl CaptureShared {
    fn deliver(&self, volume: VolumeSample, frames: Vec<Vec<i16>>) {
        self.session.publish(SessionEvent::Volume(volume));

        for samples in frames {
            if self.muted.load(Ordering::Acquire) {
                continue;
            }
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            let frame = AudioFrame::new(samples, self.config.target_format.sample_rate, sequence);
            self.session.publish(SessionEvent::AudioCaptured(frame.clone()));

            if !self.session.is_connected() {
                continue;
            }
            match self.session.send_audio(frame) {
                Ok(()) => {}
                // disconnected between the check and the send
                Err(LiveError::InvalidState(_)) => {}
                Err(error) => self.report(&error),
            }
        }
    }

    fn report(&self, error: &LiveError) {
        tracing::warn!(error = %error, "Capture tick failed");
        self.session.publish(SessionEvent::from_error(error));
    }
}

impl CaptureEngine {
    /// Create a stopped engine sending to `session`.
    pub fn new(session: &SessionClient, config: CaptureConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(CaptureShared {
                session: session.clone(),
                config,
                muted: AtomicBool::new(false),
                next_sequence: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        })
    }

    /// Acquire `input` and start ticking. No-op if already running.
    ///
    /// Fails with `DeviceError` if the device cannot be opened; the engine
    /// then stays stopped and `start` may be retried.
    pub fn start(&self, input: &dyn AudioInput) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let stream = input.open().map_err(|error| {
            tracing::warn!(device = input.name(), error = %error, "Microphone unavailable");
            error
        })?;
        let pipeline = CapturePipeline::new(stream.format(), &self.shared.config)?;
        tracing::info!(
            device = input.name(),
            source_rate = stream.format().sample_rate,
            channels = stream.format().channels,
            target_rate = pipeline.target().sample_rate,
            tick_ms = self.shared.config.tick_ms,
            "Capture started"
        );

        let token = CancellationToken::new();
        let task = tokio::spawn(run_capture(self.shared.clone(), stream, pipeline, token.clone()));
        *running = Some(Running { token, task });
        Ok(())
    }

    /// Stop ticking and release the device. Safe to call repeatedly.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.token.cancel();
        if running.task.await.is_err() {
            tracing::warn!("Capture loop ended abnormally");
        }
        tracing::info!("Capture stopped");
    }

    /// Whether the capture loop is running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Suppress (or resume) frame emission from the next frame boundary.
    pub fn set_muted(&self, muted: bool) {
        if self.shared.muted.swap(muted, Ordering::AcqRel) != muted {
            tracing::debug!(muted, "Capture mute changed");
        }
    }

    /// Whether frame emission is suppressed.
    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.token.cancel();
        }
    }
}

impl std::fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("running", &self.is_running())
            .field("muted", &self.is_muted())
            .field("tick_ms", &self.shared.config.tick_ms)
            .finish()
    }
}

async fn run_capture(
    shared: Arc<CaptureShared>,
    mut stream: Box<dyn InputStream>,
    mut pipeline: CapturePipeline,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(shared.config.tick());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut raw = Vec::new();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        raw.clear();
        if let Err(error) = stream.read(&mut raw) {
            shared.report(&error);
            continue;
        }
        match pipeline.process(&raw) {
            Ok((volume, frames)) => shared.deliver(volume, frames),
            Err(error) => shared.report(&error),
        }
    }
    // dropping the stream releases the device
    drop(stream);
}
