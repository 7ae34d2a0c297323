//! Audio device seam.
//!
//! The engines never talk to hardware directly. A capture device is opened as
//! a scoped [`InputStream`] (dropping it releases the device) and drained once
//! per tick; a playback device accepts PCM16 blocks through an
//! [`OutputStream`]. Both calls must return promptly: real backends buffer
//! between their own audio thread and the engine with an SPSC ring.
//!
//! [`MemoryInput`] and [`MemoryOutput`] are in-process devices for tests and
//! headless embedders. The `desktop-audio` feature adds cpal backends.

use crate::audio::AudioFormat;
use crate::error::{LiveError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// An open capture device.
pub trait InputStream: Send {
    /// Native format of the samples returned by [`read`](Self::read).
    fn format(&self) -> AudioFormat;

    /// Move every sample captured since the previous call into `out`
    /// (interleaved, normalized to [-1, 1]). Returns the number appended.
    fn read(&mut self, out: &mut Vec<f32>) -> Result<usize>;
}

/// A microphone that can be opened.
pub trait AudioInput: Send + Sync {
    /// Device name for logging.
    fn name(&self) -> &str;

    /// Acquire the device. Fails with `DeviceError` when it is unavailable or
    /// access is denied.
    fn open(&self) -> Result<Box<dyn InputStream>>;
}

/// An open playback device.
pub trait OutputStream: Send {
    /// Queue one block of mono PCM16 samples for output.
    fn write(&mut self, samples: &[i16]) -> Result<()>;
}

/// A speaker that can be opened.
pub trait AudioOutput: Send + Sync {
    /// Device name for logging.
    fn name(&self) -> &str;

    /// Acquire the device for mono output in `format`.
    fn open(&self, format: AudioFormat) -> Result<Box<dyn OutputStream>>;
}

// ── In-process devices ──────────────────────────────────────────────────

/// A capture device fed by the embedder.
#[derive(Clone)]
pub struct MemoryInput {
    shared: Arc<MemoryInputShared>,
}

struct MemoryInputShared {
    format: AudioFormat,
    pending: Mutex<VecDeque<f32>>,
    open: AtomicBool,
    unavailable: Mutex<Option<String>>,
}

impl MemoryInput {
    /// A device delivering samples in `format`.
    pub fn new(format: AudioFormat) -> Self {
        Self {
            shared: Arc::new(MemoryInputShared {
                format,
                pending: Mutex::new(VecDeque::new()),
                open: AtomicBool::new(false),
                unavailable: Mutex::new(None),
            }),
        }
    }

    /// Make every `open` fail with `reason`, or clear the fault with `None`.
    pub fn set_unavailable(&self, reason: Option<String>) {
        *self.shared.unavailable.lock() = reason;
    }

    /// Append interleaved samples for the next read.
    pub fn push(&self, samples: &[f32]) {
        self.shared.pending.lock().extend(samples.iter().copied());
    }

    /// Whether a stream currently holds the device.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }
}

impl AudioInput for MemoryInput {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&self) -> Result<Box<dyn InputStream>> {
        if let Some(reason) = self.shared.unavailable.lock().clone() {
            return Err(LiveError::device(reason));
        }
        if self.shared.open.swap(true, Ordering::SeqCst) {
            return Err(LiveError::device("input device is busy"));
        }
        Ok(Box::new(MemoryInputStream { shared: self.shared.clone() }))
    }
}

struct MemoryInputStream {
    shared: Arc<MemoryInputShared>,
}

impl InputStream for MemoryInputStream {
    fn format(&self) -> AudioFormat {
        self.shared.format
    }

    fn read(&mut self, out: &mut Vec<f32>) -> Result<usize> {
        let mut pending = self.shared.pending.lock();
        let count = pending.len();
        out.extend(pending.drain(..));
        Ok(count)
    }
}

impl Drop for MemoryInputStream {
    fn drop(&mut self) {
        self.shared.open.store(false, Ordering::SeqCst);
    }
}

/// A playback device that records every block written to it.
#[derive(Clone, Default)]
pub struct MemoryOutput {
    shared: Arc<MemoryOutputShared>,
}

#[derive(Default)]
struct MemoryOutputShared {
    blocks: Mutex<Vec<Vec<i16>>>,
    format: Mutex<Option<AudioFormat>>,
    failing: Mutex<Option<String>>,
}

impl MemoryOutput {
    /// An empty recording device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks written so far, in order.
    pub fn blocks(&self) -> Vec<Vec<i16>> {
        self.shared.blocks.lock().clone()
    }

    /// Number of blocks written so far.
    pub fn block_count(&self) -> usize {
        self.shared.blocks.lock().len()
    }

    /// Format requested by the last `open`.
    pub fn format(&self) -> Option<AudioFormat> {
        *self.shared.format.lock()
    }

    /// Make writes fail with `reason`, or clear the fault with `None`.
    pub fn set_failing(&self, reason: Option<String>) {
        *self.shared.failing.lock() = reason;
    }
}

impl AudioOutput for MemoryOutput {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&self, format: AudioFormat) -> Result<Box<dyn OutputStream>> {
        *self.shared.format.lock() = Some(format);
        Ok(Box::new(MemoryOutputStream { shared: self.shared.clone() }))
    }
}

struct MemoryOutputStream {
    shared: Arc<MemoryOutputShared>,
}

impl OutputStream for MemoryOutputStream {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        if let Some(reason) = self.shared.failing.lock().clone() {
            return Err(LiveError::device(reason));
        }
        self.shared.blocks.lock().push(samples.to_vec());
        Ok(())
    }
}

// ── cpal backends ───────────────────────────────────────────────────────

#[cfg(feature = "desktop-audio")]
pub use desktop::{CpalInput, CpalOutput};

#[cfg(feature = "desktop-audio")]
mod desktop {
    use super::{AudioInput, AudioOutput, InputStream, OutputStream};
    use crate::audio::{AudioFormat, i16_to_f32};
    use crate::error::{LiveError, Result};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, SampleRate, Stream};
    use std::sync::mpsc;
    use std::thread::JoinHandle;

    /// Ring size in seconds of audio.
    const RING_SECONDS: usize = 2;

    /// Owns a cpal stream on its own thread; cpal streams are not `Send` on
    /// every host. Dropping the handle stops the stream and joins the thread.
    struct StreamThread {
        stop: Option<mpsc::Sender<()>>,
        handle: Option<JoinHandle<()>>,
    }

    impl StreamThread {
        fn spawn<F>(name: &str, build: F) -> Result<(Self, AudioFormat)>
        where
            F: FnOnce() -> Result<(Stream, AudioFormat)> + Send + 'static,
        {
            let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<AudioFormat>>(1);
            let (stop_tx, stop_rx) = mpsc::channel::<()>();

            let handle = std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    let (stream, format) = match build() {
                        Ok(built) => built,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(LiveError::device(format!("Failed to start stream: {}", e))));
                        return;
                    }
                    let _ = ready_tx.send(Ok(format));
                    // park until the owning handle is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                })
                .map_err(|e| LiveError::device(format!("Failed to spawn audio thread: {}", e)))?;

            let format = ready_rx
                .recv()
                .map_err(|_| LiveError::device("audio thread exited during setup"))??;
            Ok((Self { stop: Some(stop_tx), handle: Some(handle) }, format))
        }
    }

    impl Drop for StreamThread {
        fn drop(&mut self) {
            self.stop.take();
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    /// The host's default microphone.
    #[derive(Debug, Default)]
    pub struct CpalInput;

    impl CpalInput {
        /// Use the default input device.
        pub fn new() -> Self {
            Self
        }
    }

    impl AudioInput for CpalInput {
        fn name(&self) -> &str {
            "cpal-default-input"
        }

        fn open(&self) -> Result<Box<dyn InputStream>> {
            let (ring_tx, ring_rx) = std::sync::mpsc::sync_channel(1);
            let (thread, format) = StreamThread::spawn("voice-capture", move || {
                let device = cpal::default_host()
                    .default_input_device()
                    .ok_or_else(|| LiveError::device("no input device available"))?;
                let supported = device
                    .default_input_config()
                    .map_err(|e| LiveError::device(format!("Input config unavailable: {}", e)))?;
                let config = supported.config();
                let format = AudioFormat { sample_rate: config.sample_rate.0, channels: config.channels };
                let capacity = format.sample_rate as usize * usize::from(format.channels) * RING_SECONDS;
                let (mut producer, consumer) = rtrb::RingBuffer::<f32>::new(capacity);
                let _ = ring_tx.send(consumer);

                let on_error = |err: cpal::StreamError| tracing::error!(error = %err, "Audio capture stream error");
                let stream = match supported.sample_format() {
                    SampleFormat::F32 => device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            for &sample in data {
                                if producer.push(sample).is_err() {
                                    break;
                                }
                            }
                        },
                        on_error,
                        None,
                    ),
                    SampleFormat::I16 => device.build_input_stream(
                        &config,
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            for &sample in data {
                                if producer.push(i16_to_f32(sample)).is_err() {
                                    break;
                                }
                            }
                        },
                        on_error,
                        None,
                    ),
                    other => {
                        return Err(LiveError::device(format!("Unsupported input sample format {:?}", other)));
                    }
                }
                .map_err(|e| LiveError::device(format!("Failed to open microphone: {}", e)))?;

                tracing::debug!(
                    device = device.name().unwrap_or_default(),
                    sample_rate = format.sample_rate,
                    channels = format.channels,
                    "Audio capture initialized"
                );
                Ok((stream, format))
            })?;
            let consumer = ring_rx
                .recv()
                .map_err(|_| LiveError::device("capture ring was not created"))?;
            Ok(Box::new(CpalInputStream { consumer, format, _thread: thread }))
        }
    }

    struct CpalInputStream {
        consumer: rtrb::Consumer<f32>,
        format: AudioFormat,
        _thread: StreamThread,
    }

    impl InputStream for CpalInputStream {
        fn format(&self) -> AudioFormat {
            self.format
        }

        fn read(&mut self, out: &mut Vec<f32>) -> Result<usize> {
            let mut count = 0;
            while let Ok(sample) = self.consumer.pop() {
                out.push(sample);
                count += 1;
            }
            Ok(count)
        }
    }

    /// The host's default speaker.
    #[derive(Debug, Default)]
    pub struct CpalOutput;

    impl CpalOutput {
        /// Use the default output device.
        pub fn new() -> Self {
            Self
        }
    }

    impl AudioOutput for CpalOutput {
        fn name(&self) -> &str {
            "cpal-default-output"
        }

        fn open(&self, format: AudioFormat) -> Result<Box<dyn OutputStream>> {
            let rate = format.sample_rate;
            let capacity = rate as usize * RING_SECONDS;
            let (producer, mut consumer) = rtrb::RingBuffer::<i16>::new(capacity);

            let (thread, _) = StreamThread::spawn("voice-playback", move || {
                let device = cpal::default_host()
                    .default_output_device()
                    .ok_or_else(|| LiveError::device("no output device available"))?;
                let supported = device
                    .supported_output_configs()
                    .map_err(|e| LiveError::device(format!("Output configs unavailable: {}", e)))?
                    .filter(|c| c.sample_format() == SampleFormat::F32)
                    .filter(|c| c.min_sample_rate() <= SampleRate(rate) && c.max_sample_rate() >= SampleRate(rate))
                    .min_by_key(|c| c.channels())
                    .ok_or_else(|| LiveError::device(format!("No output config supports {} Hz", rate)))?;
                let config = supported.with_sample_rate(SampleRate(rate)).config();
                let channels = usize::from(config.channels);

                let stream = device
                    .build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            for frame in data.chunks_mut(channels) {
                                let sample = consumer.pop().map(i16_to_f32).unwrap_or(0.0);
                                frame.fill(sample);
                            }
                        },
                        |err: cpal::StreamError| tracing::error!(error = %err, "Audio playback stream error"),
                        None,
                    )
                    .map_err(|e| LiveError::device(format!("Failed to open speaker: {}", e)))?;

                tracing::debug!(
                    device = device.name().unwrap_or_default(),
                    sample_rate = rate,
                    channels,
                    "Audio playback initialized"
                );
                Ok((stream, AudioFormat { sample_rate: rate, channels: config.channels }))
            })?;

            Ok(Box::new(CpalOutputStream { producer, _thread: thread }))
        }
    }

    struct CpalOutputStream {
        producer: rtrb::Producer<i16>,
        _thread: StreamThread,
    }

    impl OutputStream for CpalOutputStream {
        fn write(&mut self, samples: &[i16]) -> Result<()> {
            for (written, &sample) in samples.iter().enumerate() {
                if self.producer.push(sample).is_err() {
                    return Err(LiveError::BufferFull(format!(
                        "speaker ring full, {} of {} samples dropped",
                        samples.len() - written,
                        samples.len()
                    )));
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_input_is_scoped() {
        let input = MemoryInput::new(AudioFormat::mono(48_000));
        let stream = input.open().unwrap();
        assert!(input.is_open());
        assert!(matches!(input.open(), Err(LiveError::DeviceError(_))));
        drop(stream);
        assert!(!input.is_open());
        assert!(input.open().is_ok());
    }

    #[test]
    fn test_memory_input_read_drains() {
        let input = MemoryInput::new(AudioFormat::mono(16_000));
        let mut stream = input.open().unwrap();
        input.push(&[0.25, -0.25, 0.5]);
        let mut out = Vec::new();
        assert_eq!(stream.read(&mut out).unwrap(), 3);
        assert_eq!(out, vec![0.25, -0.25, 0.5]);
        assert_eq!(stream.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_unavailable_input() {
        let input = MemoryInput::new(AudioFormat::mono(16_000));
        input.set_unavailable(Some("permission denied".into()));
        assert!(matches!(input.open(), Err(LiveError::DeviceError(m)) if m == "permission denied"));
        assert!(!input.is_open());
    }

    #[test]
    fn test_memory_output_records_blocks() {
        let output = MemoryOutput::new();
        let mut stream = output.open(AudioFormat::pcm16_24khz()).unwrap();
        stream.write(&[1, 2, 3]).unwrap();
        stream.write(&[4]).unwrap();
        assert_eq!(output.blocks(), vec![vec![1, 2, 3], vec![4]]);
        assert_eq!(output.format(), Some(AudioFormat::pcm16_24khz()));

        output.set_failing(Some("unplugged".into()));
        assert!(stream.write(&[5]).is_err());
        assert_eq!(output.block_count(), 2);
    }
}
