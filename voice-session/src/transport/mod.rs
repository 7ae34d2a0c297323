//! Transport seam between the session client and the remote service.
//!
//! A [`Connector`] performs the handshake and returns a split pair of
//! text-frame endpoints. The session owns both halves: the writer task owns
//! the sink, the reader task owns the source.

use crate::config::SessionConfig;
use crate::error::Result;
use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryConnector, MemoryPeer};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

/// Outgoing half of an open connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text frame.
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<()>;
}

/// Incoming half of an open connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Read the next text frame.
    ///
    /// Returns `None` once the peer has closed the connection.
    async fn recv(&mut self) -> Option<Result<String>>;
}

/// A boxed sink for dynamic dispatch.
pub type BoxedSink = Box<dyn FrameSink>;

/// A boxed source for dynamic dispatch.
pub type BoxedSource = Box<dyn FrameSource>;

/// A factory for connections to the remote service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Short name for logging (e.g., "websocket").
    fn name(&self) -> &str;

    /// Open a connection and complete the transport handshake.
    ///
    /// Failures are reported as `LiveError::ConnectError`.
    async fn connect(&self, config: &SessionConfig) -> Result<(BoxedSink, BoxedSource)>;
}
