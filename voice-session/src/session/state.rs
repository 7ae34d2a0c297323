//! Connection lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a session.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Closing -> Disconnected
///                     |             |
///                     |             +------> Error(reason) -> Disconnected
///                     +--> Disconnected (handshake failed or aborted)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection; `connect()` may be called.
    #[default]
    Disconnected,
    /// Transport handshake and setup in progress.
    Connecting,
    /// Setup delivered; audio and messages flow.
    Connected,
    /// `disconnect()` is tearing the connection down.
    Closing,
    /// The transport dropped; an explicit reconnect is required.
    Error(String),
}

impl ConnectionState {
    /// Whether sends are currently accepted.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether `connect()` may start from this state.
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error(_))
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Closing)
                | (Connected, Error(_))
                | (Closing, Disconnected)
                | (Error(_), Disconnected)
        )
    }

    /// Short lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Error(_) => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(reason) => write!(f, "error ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}
