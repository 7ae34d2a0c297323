//! Configuration types for sessions, capture, playback and tool dispatch.

use crate::audio::AudioFormat;
use crate::error::{LiveError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::time::Duration;

/// Default model requested in the setup message.
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview";

/// Output modality requested from the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    /// Spoken audio responses.
    #[default]
    Audio,
    /// Text responses.
    Text,
}

/// A callable tool offered to the remote peer.
///
/// Declarations are fixed before `connect()` and stay immutable for the
/// lifetime of the session they were sent with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    /// Tool name.
    pub name: String,
    /// Tool description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments object.
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl ToolDeclaration {
    /// Create a new declaration taking no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), description: String::new(), parameters: empty_object_schema() }
    }

    /// Set the tool description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Set the parameters schema.
    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }
}

/// Configuration for one session, sent to the remote peer in the setup message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Model to use.
    pub model: String,
    /// Output modalities.
    pub response_modalities: Vec<Modality>,
    /// Prebuilt voice name for audio output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    /// System instruction for the conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    /// Tools offered to the remote peer.
    pub tools: Vec<ToolDeclaration>,
    /// Format of outbound microphone audio; frames at any other rate are
    /// rejected by `send_audio`.
    pub input_format: AudioFormat,
    /// Format assumed for inbound audio that carries no rate.
    pub output_format: AudioFormat,
    /// Outbound audio frames kept before the oldest are dropped.
    pub outbound_audio_capacity: usize,
    /// Outbound text/tool-response messages buffered before senders wait.
    pub control_capacity: usize,
    /// Handshake budget in milliseconds.
    pub connect_timeout_ms: u64,
    /// Budget for a single transport write in milliseconds.
    pub write_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            response_modalities: vec![Modality::Audio],
            voice: None,
            system_instruction: None,
            tools: Vec::new(),
            input_format: AudioFormat::pcm16_16khz(),
            output_format: AudioFormat::pcm16_24khz(),
            outbound_audio_capacity: 50,
            control_capacity: 64,
            connect_timeout_ms: 10_000,
            write_timeout_ms: 5_000,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for SessionConfig.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the system instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Set the voice.
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    /// Set output modalities.
    pub fn with_modalities(mut self, modalities: Vec<Modality>) -> Self {
        self.response_modalities = modalities;
        self
    }

    /// Add a tool declaration.
    pub fn with_tool(mut self, tool: ToolDeclaration) -> Self {
        self.tools.push(tool);
        self
    }

    /// Set the outbound audio queue bound.
    pub fn with_outbound_audio_capacity(mut self, frames: usize) -> Self {
        self.outbound_audio_capacity = frames;
        self
    }

    /// Handshake budget.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Single-write budget.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Check the configuration before it is used for a session.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(LiveError::config("model must not be empty"));
        }
        if self.response_modalities.is_empty() {
            return Err(LiveError::config("at least one response modality is required"));
        }
        if self.outbound_audio_capacity == 0 || self.control_capacity == 0 {
            return Err(LiveError::config("queue capacities must be non-zero"));
        }
        if self.input_format.sample_rate == 0 || self.output_format.sample_rate == 0 {
            return Err(LiveError::config("sample rates must be non-zero"));
        }
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if tool.name.is_empty() {
                return Err(LiveError::config("tool name must not be empty"));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(LiveError::config(format!("duplicate tool declaration '{}'", tool.name)));
            }
        }
        Ok(())
    }
}

/// Builder for SessionConfig.
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the model.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    /// Set the system instruction.
    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.config.system_instruction = Some(instruction.into());
        self
    }

    /// Set the voice.
    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.config.voice = Some(voice.into());
        self
    }

    /// Request text responses in addition to audio.
    pub fn with_text(mut self) -> Self {
        if !self.config.response_modalities.contains(&Modality::Text) {
            self.config.response_modalities.push(Modality::Text);
        }
        self
    }

    /// Add a tool.
    pub fn tool(mut self, tool: ToolDeclaration) -> Self {
        self.config.tools.push(tool);
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Capture engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interval between capture ticks in milliseconds.
    pub tick_ms: u64,
    /// Format frames are converted to before they are sent.
    pub target_format: AudioFormat,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { tick_ms: 20, target_format: AudioFormat::pcm16_16khz() }
    }
}

impl CaptureConfig {
    /// Interval between capture ticks.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Set the tick interval.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_ms = tick.as_millis() as u64;
        self
    }

    /// Samples per emitted frame at the target rate.
    pub fn frame_len(&self) -> usize {
        self.target_format.samples_for(self.tick())
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 || self.frame_len() == 0 {
            return Err(LiveError::config("capture tick must cover at least one sample"));
        }
        Ok(())
    }
}

/// Playback engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Ring capacity in frames.
    pub capacity: usize,
    /// Length of inserted silence on underrun, in milliseconds.
    pub silence_ms: u64,
    /// Output device format.
    pub format: AudioFormat,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { capacity: 256, silence_ms: 20, format: AudioFormat::pcm16_24khz() }
    }
}

impl PlaybackConfig {
    /// Silence inserted per starved tick.
    pub fn silence(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }

    /// Set the ring capacity.
    pub fn with_capacity(mut self, frames: usize) -> Self {
        self.capacity = frames;
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(LiveError::config("playback capacity must be non-zero"));
        }
        if self.silence_ms == 0 {
            return Err(LiveError::config("silence tick must be non-zero"));
        }
        Ok(())
    }
}

/// Tool dispatcher settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Window in milliseconds for collecting a batch's responses before flushing.
    pub debounce_ms: u64,
    /// Budget in milliseconds for a single handler.
    pub handler_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { debounce_ms: 200, handler_timeout_ms: 5_000 }
    }
}

impl DispatcherConfig {
    /// Debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Handler budget.
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Set the debounce window.
    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce_ms = window.as_millis() as u64;
        self
    }

    /// Set the handler budget.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.response_modalities, vec![Modality::Audio]);
        assert_eq!(config.input_format.sample_rate, 16_000);
        assert_eq!(config.output_format.sample_rate, 24_000);
        assert!(config.validate().is_ok());

        assert_eq!(CaptureConfig::default().frame_len(), 320);
        assert_eq!(DispatcherConfig::default().debounce(), Duration::from_millis(200));
    }

    #[test]
    fn test_duplicate_tools_rejected() {
        let result = SessionConfig::builder()
            .tool(ToolDeclaration::new("render"))
            .tool(ToolDeclaration::new("render"))
            .build();
        assert!(matches!(result, Err(LiveError::ConfigError(_))));
    }

    #[test]
    fn test_empty_model_rejected() {
        let config = SessionConfig::default().with_model("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: SessionConfig = serde_json::from_value(json!({
            "model": "models/live",
            "response_modalities": ["AUDIO", "TEXT"],
            "voice": "Puck",
            "tools": [{ "name": "log_question_start" }]
        }))
        .unwrap();

        assert_eq!(config.model, "models/live");
        assert_eq!(config.response_modalities, vec![Modality::Audio, Modality::Text]);
        assert_eq!(config.outbound_audio_capacity, 50);
        assert_eq!(config.tools[0].parameters["type"], "object");
    }

    #[test]
    fn test_capture_config_rejects_zero_tick() {
        let config = CaptureConfig { tick_ms: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
