//! WebSocket transport built on tokio-tungstenite.

use super::{BoxedSink, BoxedSource, Connector, FrameSink, FrameSource};
use crate::config::SessionConfig;
use crate::error::{LiveError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::connect_async;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;
type WsSource = futures::stream::SplitStream<WsStream>;

/// Connects to the remote service over a WebSocket.
pub struct WebSocketConnector {
    url: url::Url,
    bearer_token: Option<SecretString>,
}

impl WebSocketConnector {
    /// Create a connector for a `ws://` or `wss://` endpoint.
    pub fn new(endpoint: &str) -> Result<Self> {
        let url = url::Url::parse(endpoint)
            .map_err(|e| LiveError::config(format!("Invalid endpoint URL: {}", e)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url, bearer_token: None }),
            other => Err(LiveError::config(format!("Unsupported endpoint scheme '{}'", other))),
        }
    }

    /// Authenticate with an `Authorization: Bearer` header.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(SecretString::from(token.into()));
        self
    }

    /// The endpoint this connector dials.
    pub fn endpoint(&self) -> &url::Url {
        &self.url
    }
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("host", &self.url.host_str())
            .field("authenticated", &self.bearer_token.is_some())
            .finish()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(&self, config: &SessionConfig) -> Result<(BoxedSink, BoxedSource)> {
        let mut request = self.url.as_str().into_client_request().map_err(|e| {
            LiveError::connect(format!("Failed to create client request: {}", e))
        })?;

        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| LiveError::connect(format!("Invalid auth token header: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        tracing::info!(host = ?self.url.host_str(), model = %config.model, "Opening WebSocket");
        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| LiveError::connect(format!("WebSocket connect error: {}", e)))?;
        tracing::debug!(status = %response.status(), "WebSocket handshake complete");

        let (sink, source) = stream.split();
        Ok((Box::new(WsFrameSink { sink }), Box::new(WsFrameSource { source })))
    }
}

struct WsFrameSink {
    sink: WsSink,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| LiveError::transport(format!("Send error: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| LiveError::transport(format!("Close error: {}", e)))
    }
}

struct WsFrameSource {
    source: WsSource,
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.source.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes.to_vec()).map_err(|e| {
                        LiveError::protocol(format!("Invalid UTF-8 in binary message: {}", e))
                    }));
                }
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "WebSocket closed by peer");
                    return None;
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(LiveError::transport(format!("Receive error: {}", e)))),
            }
        }
    }
}
