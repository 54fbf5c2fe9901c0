//! Typed event bus between a session and its editor binding.
//!
//! Two ways to observe a session:
//! - `on(kind, handler)`: synchronous callbacks filtered by [`EventKind`],
//!   run on the session's task right after the state change.
//! - `subscribe()`: a tokio broadcast receiver carrying every event.
//!
//! Payloads are owned snapshots; observers never see live session state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::codec::Operation;
use crate::error::SessionError;
use crate::participants::{RemoteCursor, RemoteSelection, RosterDelta};
use crate::session::{StartOptions, SyncState};

/// Capacity of the broadcast channel behind [`EventBus::subscribe`].
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by a sync session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Content replaced by a remote patch or a full sync.
    ContentChanged {
        content: String,
        previous: String,
        operations: Vec<Operation>,
    },
    CursorMoved { user_id: String, cursor: RemoteCursor },
    CursorRemoved { user_id: String },
    SelectionMoved { user_id: String, selection: RemoteSelection },
    SelectionRemoved { user_id: String },
    ParticipantsChanged(RosterDelta),
    SyncStateChanged(SyncState),
    /// Document dirty flag.
    Modified(bool),
    /// The session was (re)bound to its environment.
    EnvUpdated(StartOptions),
    /// The server redirected the session to another path.
    FilePath(String),
    Error(SessionError),
    Closed,
}

/// Discriminant of [`SessionEvent`], used to filter handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Content,
    CursorMove,
    CursorRemove,
    SelectionMove,
    SelectionRemove,
    Participants,
    SyncState,
    Modified,
    EnvUpdated,
    FilePath,
    Error,
    Close,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ContentChanged { .. } => EventKind::Content,
            Self::CursorMoved { .. } => EventKind::CursorMove,
            Self::CursorRemoved { .. } => EventKind::CursorRemove,
            Self::SelectionMoved { .. } => EventKind::SelectionMove,
            Self::SelectionRemoved { .. } => EventKind::SelectionRemove,
            Self::ParticipantsChanged(_) => EventKind::Participants,
            Self::SyncStateChanged(_) => EventKind::SyncState,
            Self::Modified(_) => EventKind::Modified,
            Self::EnvUpdated(_) => EventKind::EnvUpdated,
            Self::FilePath(_) => EventKind::FilePath,
            Self::Error(_) => EventKind::Error,
            Self::Closed => EventKind::Close,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct BusInner {
    handlers: Mutex<Vec<(SubscriptionId, EventKind, Handler)>>,
    next_id: AtomicU64,
    channel: broadcast::Sender<SessionEvent>,
}

/// Cloneable event bus; clones share handlers and channel.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                channel,
            }),
        }
    }

    /// Register `handler` for events of `kind`.
    ///
    /// Handlers run synchronously on the emitting task and must not block.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers().push((id, kind, Arc::new(handler)));
        id
    }

    /// Unregister a handler. Returns whether it was registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers();
        let before = handlers.len();
        handlers.retain(|(sid, _, _)| *sid != id);
        handlers.len() != before
    }

    /// Receive every event through a broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.channel.subscribe()
    }

    /// Deliver an event to matching handlers, then to subscribers.
    pub fn emit(&self, event: SessionEvent) {
        let kind = event.kind();
        // Snapshot so handlers may register/unregister while running.
        let matching: Vec<Handler> = self
            .handlers()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| h.clone())
            .collect();
        for handler in matching {
            handler(&event);
        }
        let _ = self.inner.channel.send(event);
    }

    /// Drop every registered handler.
    pub fn clear(&self) {
        self.handlers().clear();
    }

    pub fn handler_count(&self) -> usize {
        self.handlers().len()
    }

    fn handlers(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, EventKind, Handler)>> {
        self.inner.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .field("subscribers", &self.inner.channel.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handlers_filtered_by_kind() {
        let bus = EventBus::new();
        let modified = Arc::new(AtomicUsize::new(0));
        let counter = modified.clone();
        bus.on(EventKind::Modified, move |event| {
            assert_eq!(event, &SessionEvent::Modified(true));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(SessionEvent::Modified(true));
        bus.emit(SessionEvent::FilePath("/other".into()));
        assert_eq!(modified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_and_clear() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = bus.on(EventKind::Close, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.on(EventKind::Close, |_| {});
        assert_eq!(bus.handler_count(), 2);

        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(SessionEvent::Closed);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.clear();
        assert_eq!(bus.handler_count(), 0);
    }

    #[test]
    fn test_handler_may_register_while_emitting() {
        let bus = EventBus::new();
        let inner = bus.clone();
        bus.on(EventKind::Close, move |_| {
            inner.on(EventKind::Close, |_| {});
        });
        bus.emit(SessionEvent::Closed);
        assert_eq!(bus.handler_count(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_receives_all() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SessionEvent::SyncStateChanged(SyncState::Stable));
        bus.emit(SessionEvent::Closed);
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::SyncStateChanged(SyncState::Stable));
        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::Close);
    }
}
