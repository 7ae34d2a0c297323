//! Typed event bus connecting the session to its collaborators.
//!
//! Each event kind carries its own payload type; subscribers register for a
//! single [`EventKind`] and receive every occurrence of it exactly once.

use crate::audio::{AudioFrame, VolumeSample};
use crate::error::{ErrorKind, LiveError};
use crate::protocol::ToolCallBatch;
use crate::session::ConnectionState;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Events published by the session and its engines.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The connection state changed.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// The setup message was delivered; the conversation may start.
    Ready,
    /// Speech output arrived from the peer.
    AudioReceived(AudioFrame),
    /// Incremental text output arrived from the peer.
    TextDelta(String),
    /// The peer requested tool calls.
    ToolCall(ToolCallBatch),
    /// Outstanding calls that can no longer be answered.
    ToolCallsCancelled(Vec<String>),
    /// The model finished its turn.
    TurnComplete,
    /// The peer barged in.
    Interrupted,
    /// The peer performed an external lookup.
    Grounding {
        /// The lookup query.
        query: String,
    },
    /// Microphone level, published every capture tick.
    Volume(VolumeSample),
    /// A microphone frame ready for transmission.
    AudioCaptured(AudioFrame),
    /// Playback ran dry and silence was inserted.
    Underrun {
        /// Silence inserted, in milliseconds.
        inserted_ms: u64,
    },
    /// Buffered playback was discarded.
    PlaybackFlushed {
        /// Frames discarded.
        frames: usize,
    },
    /// A fault worth surfacing to the user or the log.
    Error {
        /// Failure category.
        kind: ErrorKind,
        /// Human-readable description.
        message: String,
    },
}

impl SessionEvent {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::Ready => EventKind::Ready,
            Self::AudioReceived(_) => EventKind::AudioReceived,
            Self::TextDelta(_) => EventKind::TextDelta,
            Self::ToolCall(_) => EventKind::ToolCall,
            Self::ToolCallsCancelled(_) => EventKind::ToolCallsCancelled,
            Self::TurnComplete => EventKind::TurnComplete,
            Self::Interrupted => EventKind::Interrupted,
            Self::Grounding { .. } => EventKind::Grounding,
            Self::Volume(_) => EventKind::Volume,
            Self::AudioCaptured(_) => EventKind::AudioCaptured,
            Self::Underrun { .. } => EventKind::Underrun,
            Self::PlaybackFlushed { .. } => EventKind::PlaybackFlushed,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// Build an error event from a crate error.
    pub fn from_error(error: &LiveError) -> Self {
        Self::Error { kind: error.kind(), message: error.to_string() }
    }
}

/// Discriminant of [`SessionEvent`], used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`SessionEvent::StateChanged`].
    StateChanged,
    /// See [`SessionEvent::Ready`].
    Ready,
    /// See [`SessionEvent::AudioReceived`].
    AudioReceived,
    /// See [`SessionEvent::TextDelta`].
    TextDelta,
    /// See [`SessionEvent::ToolCall`].
    ToolCall,
    /// See [`SessionEvent::ToolCallsCancelled`].
    ToolCallsCancelled,
    /// See [`SessionEvent::TurnComplete`].
    TurnComplete,
    /// See [`SessionEvent::Interrupted`].
    Interrupted,
    /// See [`SessionEvent::Grounding`].
    Grounding,
    /// See [`SessionEvent::Volume`].
    Volume,
    /// See [`SessionEvent::AudioCaptured`].
    AudioCaptured,
    /// See [`SessionEvent::Underrun`].
    Underrun,
    /// See [`SessionEvent::PlaybackFlushed`].
    PlaybackFlushed,
    /// See [`SessionEvent::Error`].
    Error,
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
}

/// Synchronous publish/subscribe hub.
///
/// Handlers run on the publishing thread. The subscriber list is snapshotted
/// before delivery, so handlers may call `on`/`off` without deadlocking and a
/// handler removed mid-delivery still sees the event being delivered.
#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Arc::new(Subscription {
            id,
            kind,
            handler: Arc::new(handler),
        }));
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Deliver `event` to every handler subscribed to its kind.
    pub fn emit(&self, event: &SessionEvent) {
        let kind = event.kind();
        let targets: Vec<Arc<Subscription>> =
            self.subscriptions.read().iter().filter(|s| s.kind == kind).cloned().collect();
        for subscription in targets {
            (subscription.handler)(event);
        }
    }

    /// Number of handlers subscribed to `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscriptions.read().iter().filter(|s| s.kind == kind).count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("subscriptions", &self.subscriptions.read().len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_delivers_only_matching_kind() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        bus.on(EventKind::TextDelta, move |event| sink.lock().push(event.clone()));

        bus.emit(&SessionEvent::TurnComplete);
        bus.emit(&SessionEvent::TextDelta("hello".into()));

        assert_eq!(*seen.lock(), vec![SessionEvent::TextDelta("hello".into())]);
    }

    #[test]
    fn test_off_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));

        let counter = count.clone();
        let id = bus.on(EventKind::Ready, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&SessionEvent::Ready);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&SessionEvent::Ready);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicU64::new(0));

        let (bus_ref, slot_ref, counter) = (bus.clone(), slot.clone(), count.clone());
        let id = bus.on(EventKind::Interrupted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = slot_ref.lock().take() {
                bus_ref.off(id);
            }
        });
        *slot.lock() = Some(id);

        bus.emit(&SessionEvent::Interrupted);
        bus.emit(&SessionEvent::Interrupted);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(EventKind::Interrupted), 0);
    }

    #[test]
    fn test_error_event_carries_kind() {
        let event = SessionEvent::from_error(&LiveError::protocol("bad frame"));
        assert_eq!(event.kind(), EventKind::Error);
        match event {
            SessionEvent::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::Protocol);
                assert!(message.contains("bad frame"));
            }
            _ => panic!("Expected Error event"),
        }
    }
}
