//! Error types for the voice session client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, LiveError>;

/// Errors that can occur while capturing, streaming or playing audio.
#[derive(Error, Debug)]
pub enum LiveError {
    /// Capture or playback device unavailable or permission denied.
    #[error("Device error: {0}")]
    DeviceError(String),

    /// The connection dropped or a write failed.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The handshake with the remote service failed.
    #[error("Connect error: {0}")]
    ConnectError(String),

    /// Malformed or unexpected inbound message.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A tool handler missed its time budget.
    #[error("Tool '{name}' timed out after {timeout_ms} ms")]
    ToolTimeout {
        /// Name of the tool that timed out.
        name: String,
        /// Budget that was exceeded.
        timeout_ms: u64,
    },

    /// A tool handler returned an error.
    #[error("Tool execution error: {0}")]
    ToolError(String),

    /// The operation is not valid in the current connection state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An audio frame arrived with a sequence number that does not advance.
    #[error("Out-of-order frame: sequence {sequence} after {last}")]
    OutOfOrder {
        /// Sequence number of the rejected frame.
        sequence: u64,
        /// Last sequence number accepted in this session.
        last: u64,
    },

    /// A bounded buffer had no room for the item.
    #[error("Buffer full: {0}")]
    BufferFull(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Audio format error.
    #[error("Audio format error: {0}")]
    AudioFormatError(String),

    /// A transport write did not complete within its budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl LiveError {
    /// Create a new device error.
    pub fn device<S: Into<String>>(msg: S) -> Self {
        Self::DeviceError(msg.into())
    }

    /// Create a new transport error.
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::TransportError(msg.into())
    }

    /// Create a new connect (handshake) error.
    pub fn connect<S: Into<String>>(msg: S) -> Self {
        Self::ConnectError(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Create a new invalid-state error.
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Create a new audio format error.
    pub fn audio<S: Into<String>>(msg: S) -> Self {
        Self::AudioFormatError(msg.into())
    }

    /// Create a new tool error.
    pub fn tool<S: Into<String>>(msg: S) -> Self {
        Self::ToolError(msg.into())
    }

    /// The failure category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceError(_) => ErrorKind::Device,
            Self::TransportError(_) | Self::ConnectError(_) | Self::Timeout(_) => {
                ErrorKind::Transport
            }
            Self::ProtocolError(_) | Self::SerializationError(_) | Self::AudioFormatError(_) => {
                ErrorKind::Protocol
            }
            Self::ToolTimeout { .. } => ErrorKind::ToolTimeout,
            Self::ToolError(_) => ErrorKind::Tool,
            Self::BufferFull(_) => ErrorKind::Buffer,
            Self::InvalidState(_) | Self::OutOfOrder { .. } | Self::ConfigError(_) => {
                ErrorKind::Usage
            }
        }
    }

    /// Whether the session has to be reconnected explicitly after this error.
    pub fn is_fatal_to_session(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

/// Coarse failure categories published on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Capture/playback device failure.
    Device,
    /// Connection dropped or handshake failed.
    Transport,
    /// Malformed inbound message; the session continues.
    Protocol,
    /// A tool handler missed its budget.
    ToolTimeout,
    /// A tool handler failed.
    Tool,
    /// A bounded buffer overflowed.
    Buffer,
    /// The remote service reported an error.
    Remote,
    /// The caller used the API incorrectly.
    Usage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Device => "device",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::ToolTimeout => "tool_timeout",
            Self::Tool => "tool",
            Self::Buffer => "buffer",
            Self::Remote => "remote",
            Self::Usage => "usage",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(LiveError::device("no mic").kind(), ErrorKind::Device);
        assert_eq!(LiveError::connect("refused").kind(), ErrorKind::Transport);
        assert_eq!(LiveError::protocol("bad json").kind(), ErrorKind::Protocol);
        assert_eq!(
            LiveError::ToolTimeout { name: "x".into(), timeout_ms: 10 }.kind(),
            ErrorKind::ToolTimeout
        );
        assert_eq!(LiveError::invalid_state("disconnected").kind(), ErrorKind::Usage);
    }

    #[test]
    fn test_only_transport_errors_are_fatal() {
        assert!(LiveError::transport("reset").is_fatal_to_session());
        assert!(!LiveError::protocol("bad").is_fatal_to_session());
        assert!(!LiveError::BufferFull("ring".into()).is_fatal_to_session());
    }

    #[test]
    fn test_display_keeps_context() {
        let err = LiveError::ToolTimeout { name: "render".into(), timeout_ms: 250 };
        let text = err.to_string();
        assert!(text.contains("render"));
        assert!(text.contains("250"));
    }
}
