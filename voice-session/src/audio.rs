//! Audio format definitions, frames and sample utilities.

use crate::error::{LiveError, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Sample rate the remote service expects for microphone audio.
pub const DEFAULT_INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate the remote service produces for speech output.
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Wire audio format: 16-bit little-endian PCM at a given rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz (e.g., 24000, 16000).
    pub sample_rate: u32,
    /// Number of audio channels (the wire is always mono).
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::pcm16_16khz()
    }
}

impl AudioFormat {
    /// Create a mono PCM16 format at the given rate.
    pub fn mono(sample_rate: u32) -> Self {
        Self { sample_rate, channels: 1 }
    }

    /// PCM16 format at 16kHz (microphone input).
    pub fn pcm16_16khz() -> Self {
        Self::mono(DEFAULT_INPUT_SAMPLE_RATE)
    }

    /// PCM16 format at 24kHz (speech output).
    pub fn pcm16_24khz() -> Self {
        Self::mono(DEFAULT_OUTPUT_SAMPLE_RATE)
    }

    /// Calculate bytes per second for this format.
    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * u32::from(self.channels) * 2
    }

    /// Number of samples (per channel) covering `duration`.
    pub fn samples_for(&self, duration: Duration) -> usize {
        (u128::from(self.sample_rate) * duration.as_micros() / 1_000_000) as usize
    }

    /// MIME type announced on outbound audio chunks.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Parse the `rate=` parameter of an `audio/pcm` MIME type.
    ///
    /// Returns `None` for other MIME types or when no rate is given.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        let mut parts = mime.split(';').map(str::trim);
        let base = parts.next()?;
        if !base.eq_ignore_ascii_case("audio/pcm") {
            return None;
        }
        parts
            .filter_map(|p| p.strip_prefix("rate="))
            .find_map(|rate| rate.parse::<u32>().ok())
            .filter(|rate| *rate > 0)
            .map(Self::mono)
    }
}

/// A fixed block of mono PCM16 samples, tagged with its rate, its position in
/// the stream and the instant it was produced.
///
/// Frames are created once per capture/receive tick, consumed (sent or played)
/// and dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    sequence: u64,
    timestamp: Instant,
}

impl AudioFrame {
    /// Create a new frame stamped with the current instant.
    pub fn new(samples: Vec<i16>, sample_rate: u32, sequence: u64) -> Self {
        Self { samples, sample_rate, sequence, timestamp: Instant::now() }
    }

    /// Create a frame of silence lasting `duration`.
    pub fn silence(sample_rate: u32, duration: Duration, sequence: u64) -> Self {
        let len = AudioFormat::mono(sample_rate).samples_for(duration);
        Self::new(vec![0; len], sample_rate, sequence)
    }

    /// Decode a frame from PCM16 little-endian bytes.
    pub fn from_pcm16_le(bytes: &[u8], sample_rate: u32, sequence: u64) -> Result<Self> {
        if bytes.len() % 2 != 0 {
            return Err(LiveError::audio(format!(
                "Invalid data length for PCM16: {} (must be even)",
                bytes.len()
            )));
        }
        let samples =
            bytes.chunks_exact(2).map(|pair| i16::from_le_bytes([pair[0], pair[1]])).collect();
        Ok(Self::new(samples, sample_rate, sequence))
    }

    /// Decode a frame from base64-encoded PCM16 little-endian bytes.
    pub fn from_base64(encoded: &str, sample_rate: u32, sequence: u64) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| LiveError::audio(format!("Invalid base64 audio payload: {}", e)))?;
        Self::from_pcm16_le(&bytes, sample_rate, sequence)
    }

    /// Samples of this frame.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Consume the frame, returning its samples.
    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Position of this frame in its stream.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When the frame was produced.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration at the frame's native rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / u64::from(self.sample_rate))
    }

    /// Encode samples as PCM16 little-endian bytes.
    pub fn to_pcm16_le(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        data
    }

    /// Encode samples as base64 PCM16 little-endian, as carried on the wire.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_pcm16_le())
    }
}

/// Normalized microphone level in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct VolumeSample(f32);

impl VolumeSample {
    /// Silence.
    pub const SILENT: Self = Self(0.0);

    /// Build a sample, clamping into `[0, 1]`. NaN maps to silence.
    pub fn new(level: f32) -> Self {
        if level.is_nan() { Self::SILENT } else { Self(level.clamp(0.0, 1.0)) }
    }

    /// RMS level of float samples nominally in `[-1, 1]`.
    ///
    /// Clipped input (magnitudes above 1.0) still yields at most 1.0.
    pub fn from_samples(samples: &[f32]) -> Self {
        if samples.is_empty() {
            return Self::SILENT;
        }
        let sum_sq: f64 = samples
            .iter()
            .map(|s| {
                let s = if s.is_finite() { f64::from(s.clamp(-1.0, 1.0)) } else { 0.0 };
                s * s
            })
            .sum();
        Self::new((sum_sq / samples.len() as f64).sqrt() as f32)
    }

    /// The level as a float in `[0, 1]`.
    pub fn level(self) -> f32 {
        self.0
    }
}

/// Convert a float sample in `[-1, 1]` to PCM16, saturating on overflow.
pub fn f32_to_i16(sample: f32) -> i16 {
    if !sample.is_finite() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Convert a PCM16 sample to a float in `[-1, 1)`.
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Average interleaved channels into a mono signal.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Converts a mono stream between sample rates in fixed-size blocks.
///
/// Input is accumulated until a full block is available, so output is
/// produced in bursts; leftover input carries over to the next call.
pub struct Resampler {
    inner: Option<rubato::FftFixedIn<f32>>,
    pending: Vec<f32>,
    from_rate: u32,
    to_rate: u32,
}

impl Resampler {
    /// Create a resampler converting `from_rate` to `to_rate`, consuming input
    /// in blocks of `block` samples.
    pub fn new(from_rate: u32, to_rate: u32, block: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(LiveError::audio("sample rate must be non-zero"));
        }
        let inner = if from_rate == to_rate {
            None
        } else {
            let resampler = rubato::FftFixedIn::<f32>::new(
                from_rate as usize,
                to_rate as usize,
                block.max(1),
                2,
                1,
            )
            .map_err(|e| LiveError::audio(format!("Resampler init failed: {}", e)))?;
            Some(resampler)
        };
        Ok(Self { inner, pending: Vec::new(), from_rate, to_rate })
    }

    /// Source rate in Hz.
    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Target rate in Hz.
    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Feed mono samples, appending any converted output to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        use rubato::Resampler as _;

        let Some(resampler) = self.inner.as_mut() else {
            out.extend_from_slice(input);
            return Ok(());
        };

        self.pending.extend_from_slice(input);
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                return Ok(());
            }
            let block: Vec<f32> = self.pending.drain(..needed).collect();
            let result = resampler
                .process(&[block], None)
                .map_err(|e| LiveError::audio(format!("Resample failed: {}", e)))?;
            if let Some(channel) = result.first() {
                out.extend_from_slice(channel);
            }
        }
    }
}

impl std::fmt::Debug for Resampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resampler")
            .field("from_rate", &self.from_rate)
            .field("to_rate", &self.to_rate)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_type_roundtrip() {
        let format = AudioFormat::pcm16_16khz();
        assert_eq!(format.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(AudioFormat::from_mime_type("audio/pcm;rate=24000"), Some(AudioFormat::pcm16_24khz()));
        assert_eq!(AudioFormat::from_mime_type("audio/pcm"), None);
        assert_eq!(AudioFormat::from_mime_type("audio/opus;rate=48000"), None);
        assert_eq!(AudioFormat::from_mime_type("audio/pcm; rate=abc"), None);
    }

    #[test]
    fn test_samples_for_duration() {
        let format = AudioFormat::pcm16_16khz();
        assert_eq!(format.samples_for(Duration::from_millis(20)), 320);
        assert_eq!(AudioFormat::pcm16_24khz().samples_for(Duration::from_millis(40)), 960);
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0; 480], 24_000, 0);
        assert_eq!(frame.duration(), Duration::from_millis(20));
        let silence = AudioFrame::silence(16_000, Duration::from_millis(50), 3);
        assert_eq!(silence.len(), 800);
        assert_eq!(silence.sequence(), 3);
    }

    #[test]
    fn test_frame_pcm_and_base64() {
        let samples: Vec<i16> = vec![0, 1, -1, 32767, -32768, 1000, -1000];
        let frame = AudioFrame::new(samples.clone(), 16_000, 7);
        let decoded = AudioFrame::from_base64(&frame.to_base64(), 16_000, 7).unwrap();
        assert_eq!(decoded.samples(), samples.as_slice());
    }

    #[test]
    fn test_odd_byte_payload_rejected() {
        let err = AudioFrame::from_pcm16_le(&[0, 1, 2], 16_000, 0).unwrap_err();
        assert!(matches!(err, LiveError::AudioFormatError(_)));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        assert!(AudioFrame::from_base64("not base64!!", 16_000, 0).is_err());
    }

    #[test]
    fn test_volume_silence_full_scale_and_clipped() {
        assert_eq!(VolumeSample::from_samples(&[0.0; 320]).level(), 0.0);
        assert_eq!(VolumeSample::from_samples(&[]).level(), 0.0);

        let full = VolumeSample::from_samples(&[1.0, -1.0, 1.0, -1.0]).level();
        assert!((full - 1.0).abs() < 1e-6);

        let clipped = VolumeSample::from_samples(&[4.0, -7.5, f32::INFINITY, f32::NAN]).level();
        assert!((0.0..=1.0).contains(&clipped));
    }

    #[test]
    fn test_f32_i16_conversion_saturates() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), 32767);
        assert_eq!(f32_to_i16(2.0), 32767);
        assert_eq!(f32_to_i16(-3.0), -32767);
        assert_eq!(f32_to_i16(f32::NAN), 0);
        assert!((i16_to_f32(-32768) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_downmix_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(downmix(&[0.25, 0.5], 1), vec![0.25, 0.5]);
    }

    #[test]
    fn test_resampler_passthrough_at_equal_rates() {
        let mut resampler = Resampler::new(16_000, 16_000, 320).unwrap();
        let mut out = Vec::new();
        resampler.process(&[0.1, 0.2, 0.3], &mut out).unwrap();
        assert_eq!(out, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_resampler_downsamples_by_ratio() {
        let mut resampler = Resampler::new(48_000, 16_000, 960).unwrap();
        let mut out = Vec::new();
        for _ in 0..10 {
            resampler.process(&[0.0; 960], &mut out).unwrap();
        }
        // 10 blocks of 20 ms at 48 kHz -> about 10 blocks of 320 samples
        assert_eq!(out.len(), 3200);
        assert!(out.iter().all(|s| s.abs() < 1e-3));
    }

    #[test]
    fn test_resampler_rejects_zero_rate() {
        assert!(Resampler::new(0, 16_000, 320).is_err());
    }
}
