//! Wire messages exchanged with the remote conversational service.
//!
//! Every message is a JSON object discriminated by its `type` field. Audio is
//! carried as raw PCM16 bytes internally and serialized as base64 on the wire.

use crate::audio::{AudioFormat, AudioFrame};
use crate::config::{Modality, SessionConfig, ToolDeclaration};
use crate::error::{LiveError, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ── Custom serde for base64-encoded audio ───────────────────────────────

fn deserialize_audio_bytes<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    base64::engine::general_purpose::STANDARD.decode(&s).map_err(serde::de::Error::custom)
}

fn serialize_audio_bytes<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let s = base64::engine::general_purpose::STANDARD.encode(bytes);
    serializer.serialize_str(&s)
}

fn empty_args() -> Value {
    json!({})
}

// ── Outbound ────────────────────────────────────────────────────────────

/// Session setup, sent exactly once per session right after the transport opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    /// Requested model.
    pub model: String,
    /// Requested output modalities.
    pub response_modalities: Vec<Modality>,
    /// Voice selection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<Value>,
    /// System instruction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    /// Tools the peer may call.
    pub tools: Vec<ToolDeclaration>,
}

impl SetupMessage {
    /// Build the setup message for a session configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        let speech_config = config.voice.as_ref().map(|voice| {
            json!({
                "voiceConfig": {
                    "prebuiltVoiceConfig": {
                        "voiceName": voice
                    }
                }
            })
        });

        Self {
            model: config.model.clone(),
            response_modalities: config.response_modalities.clone(),
            speech_config,
            system_instruction: config.system_instruction.clone(),
            tools: config.tools.clone(),
        }
    }
}

/// Messages sent from the client to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// Session setup.
    #[serde(rename = "setup")]
    Setup(SetupMessage),

    /// A block of microphone audio.
    #[serde(rename = "audio_chunk")]
    AudioChunk {
        /// MIME type including the sample rate.
        #[serde(rename = "mimeType")]
        mime_type: String,
        /// PCM16 little-endian bytes (base64 on the wire).
        #[serde(
            serialize_with = "serialize_audio_bytes",
            deserialize_with = "deserialize_audio_bytes"
        )]
        payload: Vec<u8>,
    },

    /// A user text message.
    #[serde(rename = "text")]
    Text {
        /// Message text.
        content: String,
    },

    /// Responses to one or more tool calls.
    #[serde(rename = "tool_response")]
    ToolResponse {
        /// One entry per answered call.
        responses: Vec<ToolResponse>,
    },
}

impl OutboundMessage {
    /// Build an audio chunk from a captured frame.
    pub fn audio(frame: &AudioFrame) -> Self {
        Self::AudioChunk {
            mime_type: AudioFormat::mono(frame.sample_rate()).mime_type(),
            payload: frame.to_pcm16_le(),
        }
    }

    /// Serialize for a text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of the message type, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::AudioChunk { .. } => "audio_chunk",
            Self::Text { .. } => "text",
            Self::ToolResponse { .. } => "tool_response",
        }
    }
}

// ── Inbound ─────────────────────────────────────────────────────────────

/// Messages received from the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// A block of speech output.
    AudioChunk {
        /// PCM16 little-endian bytes (base64 on the wire).
        #[serde(
            serialize_with = "serialize_audio_bytes",
            deserialize_with = "deserialize_audio_bytes"
        )]
        payload: Vec<u8>,
        /// Optional MIME type carrying the sample rate.
        #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },

    /// Incremental text output.
    TextDelta {
        /// Text fragment.
        content: String,
    },

    /// The peer invokes one or more tools.
    ToolCall {
        /// Calls in this batch.
        calls: Vec<ToolCall>,
    },

    /// The peer no longer needs answers for these calls.
    ToolCallCancellation {
        /// Ids of the withdrawn calls.
        ids: Vec<String>,
    },

    /// The model finished its turn.
    TurnComplete,

    /// The peer barged in; buffered output must be discarded.
    Interrupted,

    /// The peer performed an external lookup.
    Grounding {
        /// The lookup query.
        query: String,
    },

    /// The peer reported an error.
    Error {
        /// Error description.
        reason: String,
    },
}

impl InboundMessage {
    /// Parse a text frame, mapping any failure to a protocol error.
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| LiveError::protocol(format!("{}: {}", e, truncate(raw))))
    }
}

fn truncate(raw: &str) -> &str {
    const MAX: usize = 200;
    if raw.len() <= MAX {
        return raw;
    }
    let mut end = MAX;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    &raw[..end]
}

// ── Tool calls ──────────────────────────────────────────────────────────

/// A single tool invocation requested by the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id, unique within its batch.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments object.
    #[serde(default = "empty_args")]
    pub args: Value,
}

impl ToolCall {
    /// Create a new tool call.
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self { id: id.into(), name: name.into(), args }
    }
}

/// The calls delivered by one inbound `tool_call` message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolCallBatch {
    /// Calls in arrival order.
    pub calls: Vec<ToolCall>,
}

impl ToolCallBatch {
    /// Create a batch.
    pub fn new(calls: Vec<ToolCall>) -> Self {
        Self { calls }
    }

    /// Ids of all calls in the batch.
    pub fn ids(&self) -> Vec<String> {
        self.calls.iter().map(|c| c.id.clone()).collect()
    }

    /// Number of calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// A tool response to send back to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    /// The call id being answered.
    pub id: String,
    /// Tool name of the call.
    pub name: String,
    /// Result payload.
    pub output: Value,
}

impl ToolResponse {
    /// Create a new tool response.
    pub fn new(id: impl Into<String>, name: impl Into<String>, output: Value) -> Self {
        Self { id: id.into(), name: name.into(), output }
    }

    /// A success payload. Object outputs gain `success: true` unless the
    /// handler set `success` itself; anything else is wrapped as
    /// `{success: true, result}`.
    pub fn success(call: &ToolCall, output: Value) -> Self {
        let output = match output {
            Value::Object(mut map) => {
                map.entry("success").or_insert(Value::Bool(true));
                Value::Object(map)
            }
            Value::Null => json!({ "success": true }),
            other => json!({ "success": true, "result": other }),
        };
        Self::new(call.id.clone(), call.name.clone(), output)
    }

    /// A failure payload `{success: false, error}`.
    pub fn failure(call: &ToolCall, error: impl Into<String>) -> Self {
        Self::new(
            call.id.clone(),
            call.name.clone(),
            json!({ "success": false, "error": error.into() }),
        )
    }

    /// Whether the payload reports failure.
    pub fn is_failure(&self) -> bool {
        self.output.get("success").and_then(Value::as_bool) == Some(false)
    }
}
