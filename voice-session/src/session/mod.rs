//! The session client: connection state machine and message multiplexer.
//!
//! A [`SessionClient`] owns one logical conversation at a time. While
//! connected, two background tasks serve the link: a writer draining the
//! control FIFO and the drop-oldest audio queue into the transport, and a
//! reader decoding inbound frames and publishing them on the event bus.
//!
//! All session bookkeeping sits behind a single lock that is never held while
//! events are delivered or while awaiting.

mod outbound;
mod state;

pub use state::ConnectionState;

use crate::audio::{AudioFormat, AudioFrame};
use crate::config::SessionConfig;
use crate::error::{ErrorKind, LiveError, Result};
use crate::events::{EventBus, EventKind, SessionEvent, SubscriptionId};
use crate::protocol::{InboundMessage, OutboundMessage, SetupMessage, ToolCallBatch, ToolResponse};
use crate::tools::ToolCatalog;
use crate::transport::{BoxedSink, BoxedSource, Connector};
use outbound::{AudioQueue, CLOSE_GRACE, Counters, Writer};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Traffic counters for the current session, reset on every connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Audio chunks written to the transport.
    pub frames_sent: u64,
    /// Outbound frames discarded by back-pressure.
    pub frames_dropped: u64,
    /// Inbound audio chunks decoded.
    pub frames_received: u64,
    /// Inbound messages dropped as malformed.
    pub protocol_errors: u64,
}

/// Handle to a realtime session.
///
/// Cloning is cheap; all clones drive the same session. Construct one and
/// hand it to the capture, playback and dispatch engines.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<SessionInner>,
}

/// Non-owning handle that does not keep the session alive.
#[derive(Clone)]
pub struct WeakSessionClient {
    inner: Weak<SessionInner>,
}

impl WeakSessionClient {
    /// Recover a strong handle if the session still exists.
    pub fn upgrade(&self) -> Option<SessionClient> {
        self.inner.upgrade().map(|inner| SessionClient { inner })
    }
}

impl std::fmt::Debug for WeakSessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakSessionClient").field("alive", &(self.inner.strong_count() > 0)).finish()
    }
}

struct SessionInner {
    connector: Arc<dyn Connector>,
    bus: EventBus,
    core: Mutex<Core>,
    counters: Arc<Counters>,
}

/// Live resources of one connected session.
struct Link {
    id: u64,
    token: CancellationToken,
    control: mpsc::Sender<OutboundMessage>,
    audio: Arc<AudioQueue>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE * 2, task).await.is_err() {
                tracing::warn!("Session task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

struct Core {
    state: ConnectionState,
    session_id: Option<String>,
    link: Option<Link>,
    attempt: Option<(u64, CancellationToken)>,
    next_link_id: u64,
    /// Unanswered tool calls: id -> tool name.
    outstanding: HashMap<String, String>,
    catalog: Option<Arc<ToolCatalog>>,
    input_format: AudioFormat,
    output_format: AudioFormat,
    last_outbound_seq: Option<u64>,
    inbound_seq: u64,
}

impl Core {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            session_id: None,
            link: None,
            attempt: None,
            next_link_id: 0,
            outstanding: HashMap::new(),
            catalog: None,
            input_format: AudioFormat::pcm16_16khz(),
            output_format: AudioFormat::pcm16_24khz(),
            last_outbound_seq: None,
            inbound_seq: 0,
        }
    }

    fn transition(&mut self, to: ConnectionState) -> Option<SessionEvent> {
        if self.state == to {
            return None;
        }
        debug_assert!(self.state.can_transition_to(&to), "illegal transition {} -> {}", self.state, to);
        let from = std::mem::replace(&mut self.state, to.clone());
        tracing::info!(from = %from, to = %to, "Session state changed");
        Some(SessionEvent::StateChanged { from, to })
    }

    fn begin_session(&mut self, catalog: Arc<ToolCatalog>, config: &SessionConfig) {
        self.outstanding.clear();
        self.catalog = Some(catalog);
        self.input_format = config.input_format;
        self.output_format = config.output_format;
        self.last_outbound_seq = None;
        self.inbound_seq = 0;
        self.session_id = None;
    }

    fn retire_all_calls(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = self.outstanding.drain().map(|(id, _)| id).collect();
        ids.sort_unstable();
        ids
    }

    fn control_sender(&self, operation: &str) -> Result<mpsc::Sender<OutboundMessage>> {
        match (&self.state, &self.link) {
            (ConnectionState::Connected, Some(link)) => Ok(link.control.clone()),
            (state, _) => Err(LiveError::invalid_state(format!("cannot {} while {}", operation, state))),
        }
    }
}

impl SessionClient {
    /// Create a disconnected session that will use `connector` to reach the
    /// remote service.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                connector,
                bus: EventBus::new(),
                core: Mutex::new(Core::new()),
                counters: Arc::new(Counters::default()),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state.clone()
    }

    /// Whether the session is connected.
    pub fn is_connected(&self) -> bool {
        self.inner.core.lock().state.is_connected()
    }

    /// Id of the current session, assigned when it becomes ready.
    pub fn session_id(&self) -> Option<String> {
        self.inner.core.lock().session_id.clone()
    }

    /// Traffic counters of the current session.
    pub fn stats(&self) -> SessionStats {
        let counters = &self.inner.counters;
        SessionStats {
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            frames_dropped: counters.frames_dropped.load(Ordering::Relaxed),
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            protocol_errors: counters.protocol_errors.load(Ordering::Relaxed),
        }
    }

    /// Tool schemas compiled for the most recent session.
    pub fn tool_catalog(&self) -> Option<Arc<ToolCatalog>> {
        self.inner.core.lock().catalog.clone()
    }

    /// Ids of tool calls still awaiting a response, sorted.
    pub fn outstanding_calls(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.core.lock().outstanding.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// A handle that does not keep the session alive.
    pub fn downgrade(&self) -> WeakSessionClient {
        WeakSessionClient { inner: Arc::downgrade(&self.inner) }
    }

    /// Subscribe to one kind of event.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, handler)
    }

    /// Remove a subscription.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.bus.off(id)
    }

    /// Publish an event to this session's subscribers.
    pub fn publish(&self, event: SessionEvent) {
        self.inner.bus.emit(&event);
    }

    /// Open the transport and start a session.
    ///
    /// The setup message is the first frame written. On success the state is
    /// `Connected` and [`SessionEvent::Ready`] has been published. Allowed from
    /// `Disconnected` and from `Error` (explicit reconnect).
    pub async fn connect(&self, config: SessionConfig) -> Result<()> {
        config.validate()?;
        let catalog = Arc::new(ToolCatalog::compile(&config.tools)?);
        let setup = OutboundMessage::Setup(SetupMessage::from_config(&config)).encode()?;

        let (attempt_id, attempt, events) = {
            let mut core = self.inner.core.lock();
            if !core.state.can_connect() {
                return Err(LiveError::invalid_state(format!("cannot connect while {}", core.state)));
            }
            let mut events = Vec::new();
            if matches!(core.state, ConnectionState::Error(_)) {
                events.extend(core.transition(ConnectionState::Disconnected));
            }
            events.extend(core.transition(ConnectionState::Connecting));
            core.next_link_id += 1;
            let attempt = CancellationToken::new();
            core.attempt = Some((core.next_link_id, attempt.clone()));
            core.begin_session(catalog, &config);
            (core.next_link_id, attempt, events)
        };
        self.inner.counters.reset();
        self.inner.publish_all(events);

        tracing::info!(
            connector = self.inner.connector.name(),
            model = %config.model,
            tools = config.tools.len(),
            "Connecting session"
        );

        let result = tokio::select! {
            _ = attempt.cancelled() => Err(LiveError::invalid_state("connect aborted by disconnect")),
            result = self.handshake(&config, setup) => result,
        };
        let (sink, source) = match result {
            Ok(pair) => pair,
            Err(error) => {
                self.inner.abort_attempt(attempt_id, &error);
                return Err(error);
            }
        };

        let (session_id, events) = {
            let mut core = self.inner.core.lock();
            if !matches!(&core.attempt, Some((id, _)) if *id == attempt_id) {
                return Err(LiveError::invalid_state("connect aborted by disconnect"));
            }
            core.attempt = None;

            let audio = Arc::new(AudioQueue::new(config.outbound_audio_capacity));
            let (control_tx, control_rx) = mpsc::channel(config.control_capacity.max(1));
            let writer = Writer {
                sink,
                control: control_rx,
                audio: audio.clone(),
                token: attempt.clone(),
                write_timeout: config.write_timeout(),
                counters: self.inner.counters.clone(),
            };
            let weak = Arc::downgrade(&self.inner);
            let tasks = vec![
                tokio::spawn(run_writer(weak.clone(), attempt_id, writer)),
                tokio::spawn(run_reader(weak, attempt_id, source, attempt.clone())),
            ];
            core.link = Some(Link { id: attempt_id, token: attempt, control: control_tx, audio, tasks });

            let session_id = uuid::Uuid::new_v4().to_string();
            core.session_id = Some(session_id.clone());
            let mut events: Vec<SessionEvent> =
                core.transition(ConnectionState::Connected).into_iter().collect();
            events.push(SessionEvent::Ready);
            (session_id, events)
        };

        tracing::info!(session_id = %session_id, "Session ready");
        self.inner.publish_all(events);
        Ok(())
    }

    async fn handshake(&self, config: &SessionConfig, setup: String) -> Result<(BoxedSink, BoxedSource)> {
        let (mut sink, source) =
            tokio::time::timeout(config.connect_timeout(), self.inner.connector.connect(config))
                .await
                .map_err(|_| {
                    LiveError::connect(format!(
                        "handshake timed out after {} ms",
                        config.connect_timeout_ms
                    ))
                })??;

        match tokio::time::timeout(config.write_timeout(), sink.send(setup)).await {
            Ok(Ok(())) => Ok((sink, source)),
            Ok(Err(e)) => Err(LiveError::connect(format!("setup was not delivered: {}", e))),
            Err(_) => Err(LiveError::connect("setup write timed out")),
        }
    }

    /// Queue a microphone frame for transmission.
    ///
    /// Never waits: when the outbound queue is full the oldest unsent frames
    /// are dropped. Fails with `InvalidState` unless connected, with
    /// `AudioFormatError` if the frame's rate differs from the session's
    /// `input_format` and with `OutOfOrder` if the sequence number does not
    /// advance.
    pub fn send_audio(&self, frame: AudioFrame) -> Result<()> {
        let audio = {
            let mut core = self.inner.core.lock();
            let audio = match (&core.state, &core.link) {
                (ConnectionState::Connected, Some(link)) => link.audio.clone(),
                (state, _) => {
                    return Err(LiveError::invalid_state(format!("cannot send audio while {}", state)));
                }
            };
            if frame.sample_rate() != core.input_format.sample_rate {
                return Err(LiveError::audio(format!(
                    "frame rate {} Hz does not match the session input rate {} Hz",
                    frame.sample_rate(),
                    core.input_format.sample_rate
                )));
            }
            if let Some(last) = core.last_outbound_seq {
                if frame.sequence() <= last {
                    return Err(LiveError::OutOfOrder { sequence: frame.sequence(), last });
                }
            }
            core.last_outbound_seq = Some(frame.sequence());
            audio
        };

        let dropped = audio.push(frame);
        if dropped > 0 {
            self.inner.counters.frames_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::warn!(dropped, "Outbound audio queue full, dropped oldest frames");
        }
        Ok(())
    }

    /// Send a user text message. Ordered with other non-audio sends.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let control = self.inner.core.lock().control_sender("send text")?;
        control
            .send(OutboundMessage::Text { content: text.into() })
            .await
            .map_err(|_| LiveError::transport("session closed before the text was sent"))
    }

    /// Answer outstanding tool calls.
    ///
    /// Responses for unknown, cancelled or already-answered ids are dropped
    /// with a warning. An empty `name` is filled in from the original call.
    pub async fn send_tool_response(&self, responses: Vec<ToolResponse>) -> Result<()> {
        let (control, accepted) = {
            let mut core = self.inner.core.lock();
            let mut accepted = Vec::with_capacity(responses.len());
            for mut response in responses {
                match core.outstanding.remove(&response.id) {
                    Some(name) => {
                        if response.name.is_empty() {
                            response.name = name;
                        }
                        accepted.push(response);
                    }
                    None => tracing::warn!(
                        call_id = %response.id,
                        "Ignoring response for unknown or already-answered tool call"
                    ),
                }
            }
            if accepted.is_empty() {
                return Ok(());
            }
            (core.control_sender("send tool responses")?, accepted)
        };

        tracing::debug!(count = accepted.len(), "Sending tool responses");
        control
            .send(OutboundMessage::ToolResponse { responses: accepted })
            .await
            .map_err(|_| LiveError::transport("session closed before tool responses were sent"))
    }

    /// Close the session. Safe to call in any state and more than once.
    pub async fn disconnect(&self) -> Result<()> {
        let (link, events) = {
            let mut core = self.inner.core.lock();
            let mut events = Vec::new();
            let state = core.state.clone();
            let link = match state {
                ConnectionState::Disconnected | ConnectionState::Closing => return Ok(()),
                ConnectionState::Connecting => {
                    if let Some((_, attempt)) = core.attempt.take() {
                        attempt.cancel();
                    }
                    events.extend(core.transition(ConnectionState::Disconnected));
                    None
                }
                ConnectionState::Error(_) => {
                    events.extend(core.transition(ConnectionState::Disconnected));
                    None
                }
                ConnectionState::Connected => {
                    events.extend(core.transition(ConnectionState::Closing));
                    core.link.take()
                }
            };
            let retired = core.retire_all_calls();
            if !retired.is_empty() {
                events.push(SessionEvent::ToolCallsCancelled(retired));
            }
            (link, events)
        };
        self.inner.publish_all(events);

        let Some(link) = link else {
            return Ok(());
        };
        tracing::info!("Disconnecting session");
        link.shutdown().await;

        let event = {
            let mut core = self.inner.core.lock();
            core.session_id = None;
            core.transition(ConnectionState::Disconnected)
        };
        self.inner.publish_all(event);
        Ok(())
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("SessionClient")
            .field("connector", &self.inner.connector.name())
            .field("state", &core.state)
            .field("session_id", &core.session_id)
            .field("outstanding_calls", &core.outstanding.len())
            .finish()
    }
}

impl SessionInner {
    fn publish_all(&self, events: impl IntoIterator<Item = SessionEvent>) {
        for event in events {
            self.bus.emit(&event);
        }
    }

    fn abort_attempt(&self, attempt_id: u64, error: &LiveError) {
        let events = {
            let mut core = self.core.lock();
            if !matches!(&core.attempt, Some((id, _)) if *id == attempt_id) {
                return;
            }
            core.attempt = None;
            let mut events: Vec<SessionEvent> =
                core.transition(ConnectionState::Disconnected).into_iter().collect();
            events.push(SessionEvent::from_error(error));
            events
        };
        tracing::warn!(error = %error, "Session handshake failed");
        self.publish_all(events);
    }

    /// Move a connected session to `Error` after its transport failed.
    fn fail(&self, link_id: u64, error: LiveError) {
        let (link, events) = {
            let mut core = self.core.lock();
            match &core.link {
                Some(link) if link.id == link_id && core.state.is_connected() => {}
                _ => return,
            }
            let link = core.link.take();
            let mut events: Vec<SessionEvent> =
                core.transition(ConnectionState::Error(error.to_string())).into_iter().collect();
            events.push(SessionEvent::from_error(&error));
            let retired = core.retire_all_calls();
            if !retired.is_empty() {
                tracing::warn!(calls = ?retired, "Discarding unanswerable tool calls");
                events.push(SessionEvent::ToolCallsCancelled(retired));
            }
            (link, events)
        };

        tracing::error!(error = %error, "Session transport failed");
        if let Some(link) = link {
            link.token.cancel();
        }
        self.publish_all(events);
    }

    fn protocol_error(&self, error: &LiveError) {
        self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(error = %error, "Dropping malformed inbound message");
        self.bus.emit(&SessionEvent::from_error(error));
    }

    fn handle_inbound(&self, raw: &str) {
        let message = match InboundMessage::decode(raw) {
            Ok(message) => message,
            Err(error) => {
                self.protocol_error(&error);
                return;
            }
        };

        let event = match message {
            InboundMessage::AudioChunk { payload, mime_type } => {
                let (sequence, fallback) = {
                    let mut core = self.core.lock();
                    let sequence = core.inbound_seq;
                    core.inbound_seq += 1;
                    (sequence, core.output_format)
                };
                let rate = mime_type
                    .as_deref()
                    .and_then(AudioFormat::from_mime_type)
                    .unwrap_or(fallback)
                    .sample_rate;
                match AudioFrame::from_pcm16_le(&payload, rate, sequence) {
                    Ok(frame) => {
                        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                        SessionEvent::AudioReceived(frame)
                    }
                    Err(error) => {
                        self.protocol_error(&error);
                        return;
                    }
                }
            }
            InboundMessage::TextDelta { content } => SessionEvent::TextDelta(content),
            InboundMessage::ToolCall { calls } => {
                let batch = ToolCallBatch::new(calls);
                {
                    let mut core = self.core.lock();
                    for call in &batch.calls {
                        if core.outstanding.insert(call.id.clone(), call.name.clone()).is_some() {
                            tracing::warn!(call_id = %call.id, "Tool call id reused while still outstanding");
                        }
                    }
                }
                tracing::info!(ids = ?batch.ids(), "Tool call batch received");
                SessionEvent::ToolCall(batch)
            }
            InboundMessage::ToolCallCancellation { ids } => {
                let retired: Vec<String> = {
                    let mut core = self.core.lock();
                    ids.into_iter().filter(|id| core.outstanding.remove(id).is_some()).collect()
                };
                if retired.is_empty() {
                    tracing::debug!("Cancellation named no outstanding calls");
                    return;
                }
                tracing::info!(ids = ?retired, "Tool calls cancelled by peer");
                SessionEvent::ToolCallsCancelled(retired)
            }
            InboundMessage::TurnComplete => SessionEvent::TurnComplete,
            InboundMessage::Interrupted => {
                tracing::debug!("Peer interrupted the response");
                SessionEvent::Interrupted
            }
            InboundMessage::Grounding { query } => SessionEvent::Grounding { query },
            InboundMessage::Error { reason } => {
                tracing::warn!(reason = %reason, "Remote service reported an error");
                SessionEvent::Error { kind: ErrorKind::Remote, message: reason }
            }
        };
        self.bus.emit(&event);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if let Some((_, attempt)) = core.attempt.take() {
            attempt.cancel();
        }
        if let Some(link) = core.link.take() {
            link.token.cancel();
        }
    }
}

async fn run_writer(inner: Weak<SessionInner>, link_id: u64, writer: Writer) {
    if let Err(error) = writer.run().await {
        if let Some(inner) = inner.upgrade() {
            inner.fail(link_id, error);
        }
    }
}

async fn run_reader(
    inner: Weak<SessionInner>,
    link_id: u64,
    mut source: BoxedSource,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            frame = source.recv() => frame,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match frame {
            Some(Ok(raw)) => inner.handle_inbound(&raw),
            Some(Err(error @ LiveError::ProtocolError(_))) => inner.protocol_error(&error),
            Some(Err(error)) => {
                inner.fail(link_id, error);
                return;
            }
            None => {
                inner.fail(link_id, LiveError::transport("connection closed by peer"));
                return;
            }
        }
    }
}
