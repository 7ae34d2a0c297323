//! # voice-session
//!
//! Realtime audio and tool-call session client for conversational voice
//! services.
//!
//! The crate captures microphone audio, streams it to a remote service over a
//! persistent bidirectional session, plays the streamed speech back without
//! gaps, and answers the service's tool calls so it is never left waiting.
//!
//! ## Architecture
//!
//! ```text
//!   microphone ──► CaptureEngine ──► SessionClient::send_audio ──► transport ──► service
//!                                                                                  │
//!   speaker ◄── PlaybackEngine ◄──┐                                                │
//!                                 ├── EventBus ◄── SessionClient (reader) ◄────────┘
//!   ToolCallDispatcher ◄──────────┘        │
//!          │                               └──► UI / embedder subscriptions
//!          └──► SessionClient::send_tool_response
//! ```
//!
//! The [`SessionClient`] is the only component that talks to the transport.
//! Construct it once and pass it to the engines; they subscribe to the typed
//! [`EventBus`](events::EventBus) for what they need.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use voice_session::{
//!     CaptureConfig, CaptureEngine, DispatcherConfig, EventKind, PlaybackConfig, PlaybackEngine,
//!     SessionClient, SessionConfig, ToolCallDispatcher,
//!     device::{CpalInput, CpalOutput},
//!     tools::{RenderTool, render_declaration},
//!     transport::WebSocketConnector,
//! };
//!
//! let connector = WebSocketConnector::new("wss://example.com/live")?.with_bearer_token(token);
//! let session = SessionClient::new(Arc::new(connector));
//!
//! let playback = PlaybackEngine::new(&session, PlaybackConfig::default())?;
//! let capture = CaptureEngine::new(&session, CaptureConfig::default())?;
//! let dispatcher = ToolCallDispatcher::new(&session, DispatcherConfig::default());
//! let (render, charts) = RenderTool::channel(8);
//! dispatcher.register("render", render);
//!
//! session.on(EventKind::Ready, |_| println!("ready"));
//! session.connect(SessionConfig::builder().tool(render_declaration()).build()?).await?;
//! playback.start(&CpalOutput::new())?;
//! capture.start(&CpalInput::new())?;
//! ```

pub mod audio;
pub mod capture;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transport;

// Re-exports
pub use audio::{AudioFormat, AudioFrame, VolumeSample};
pub use capture::{CaptureEngine, CapturePipeline};
pub use config::{
    CaptureConfig, DispatcherConfig, Modality, PlaybackConfig, SessionConfig, SessionConfigBuilder,
    ToolDeclaration,
};
pub use dispatcher::{AsyncToolHandler, FnToolHandler, ToolCallDispatcher, ToolHandler};
pub use error::{ErrorKind, LiveError, Result};
pub use events::{EventBus, EventKind, SessionEvent, SubscriptionId};
pub use playback::PlaybackEngine;
pub use protocol::{InboundMessage, OutboundMessage, ToolCall, ToolCallBatch, ToolResponse};
pub use session::{ConnectionState, SessionClient, SessionStats, WeakSessionClient};
pub use tools::ToolCatalog;
pub use transport::Connector;
