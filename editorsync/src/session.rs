//! The sync session: one bound file, one transport link.
//!
//! ```text
//!                 start()
//!  Disconnected ──────────► AwaitingFullSync
//!       ▲                        │ sync
//!       │ transport close        ▼
//!       └──────────────────── Stable ◄──► Syncing
//!                                  heartbeat / any inbound
//! ```
//!
//! The session owns the dual content snapshot. Local edits are diffed
//! against the baseline and sent as patches; inbound patches go through a
//! [`PatchQueue`] so they are validated against the baseline one at a time.
//! Anything that cannot be reconciled falls back to a full `sync` request,
//! leaving local state alone until the server answers.
//!
//! All state lives in a private synchronous core behind a tokio mutex; the
//! reader, heartbeat and queue tasks only lock it and call into it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{self, Operation, Patch};
use crate::error::{SessionError, TransportError};
use crate::events::{EventBus, SessionEvent};
use crate::participants::{
    CursorColor, IdentityResolver, Participant, ParticipantRegistry, PresenceChange, RemoteCursor,
    RemoteSelection,
};
use crate::position::{Position, Selection};
use crate::protocol::{
    Action, CursorPayload, Envelope, ModifiedPayload, PatchPayload, RosterEntry, RosterPayload,
    SyncPayload,
};
use crate::queue::PatchQueue;
use crate::transport::{Connection, ConnectionState, Connector};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long after a local edit a hash mismatch is tolerated.
pub const DEFAULT_RESYNC_GRACE: Duration = Duration::from_secs(2);

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub resync_grace: Duration,
    /// Cursor color for participants without a resolvable profile.
    pub default_color: CursorColor,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            resync_grace: DEFAULT_RESYNC_GRACE,
            default_color: CursorColor::FALLBACK,
        }
    }
}

impl SessionConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_resync_grace(mut self, grace: Duration) -> Self {
        self.resync_grace = grace;
        self
    }

    pub fn with_default_color(mut self, color: CursorColor) -> Self {
        self.default_color = color;
        self
    }
}

/// Who this session speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: String,
    pub token: String,
}

impl LocalIdentity {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self { id: id.into(), token: token.into() }
    }

    /// A random identity with an empty token.
    pub fn anonymous() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), "")
    }
}

/// Options for [`SyncSession::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    /// Clear the baseline instead of keeping the in-memory content.
    pub reset: bool,
    /// Follow server path redirects through [`FileModel::stat`].
    pub autoload: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self { reset: false, autoload: true }
    }
}

impl StartOptions {
    pub fn reset() -> Self {
        Self { reset: true, ..Self::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    AwaitingFullSync,
    Syncing,
    Stable,
}

impl SyncState {
    pub fn is_stable(self) -> bool {
        self == SyncState::Stable
    }
}

/// The file a session is bound to.
pub trait FileModel: Send + Sync {
    /// Path used as the environment id.
    fn path(&self) -> String;

    /// Temporary buffers cannot be synchronized.
    fn is_buffer(&self) -> bool {
        false
    }

    /// Refresh metadata after the server redirected to `path`.
    fn stat(&self, _path: &str) {}
}

/// Baseline (last content both sides agreed on) and pending (latest local
/// content), each with its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSnapshot {
    baseline: String,
    baseline_hash: String,
    pending: String,
    pending_hash: String,
}

impl Default for ContentSnapshot {
    fn default() -> Self {
        let empty = codec::hash("");
        Self {
            baseline: String::new(),
            baseline_hash: empty.clone(),
            pending: String::new(),
            pending_hash: empty,
        }
    }
}

impl ContentSnapshot {
    pub fn baseline(&self) -> &str {
        &self.baseline
    }

    pub fn baseline_hash(&self) -> &str {
        &self.baseline_hash
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn pending_hash(&self) -> &str {
        &self.pending_hash
    }

    /// Record the latest local content.
    fn observe(&mut self, content: String) {
        self.pending_hash = codec::hash(&content);
        self.pending = content;
    }

    /// Diff baseline → pending and promote pending to baseline.
    fn commit(&mut self) -> Patch {
        let patch = codec::diff(&self.baseline, &self.pending);
        self.baseline = self.pending.clone();
        self.baseline_hash = self.pending_hash.clone();
        patch
    }

    /// Set both sides, returning the previous baseline.
    fn replace(&mut self, content: String) -> String {
        let hash = codec::hash(&content);
        self.pending = content.clone();
        self.pending_hash = hash.clone();
        self.baseline_hash = hash;
        std::mem::replace(&mut self.baseline, content)
    }
}

/// Why a resync was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    ApplyFailed,
    HashMismatch,
}

/// What happened to an inbound patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    /// Applied although the result hash disagreed, inside the grace window.
    AppliedUnverified,
    /// The baseline already has the patch's resulting hash.
    Duplicate,
    Invalid,
    Resync(ResyncReason),
    /// The session closed before the patch was processed.
    Discarded,
}

// ───────────────────────────────────────────────────────────────────
// Core
// ───────────────────────────────────────────────────────────────────

struct SessionCore {
    config: SessionConfig,
    identity: LocalIdentity,
    env_id: Option<String>,
    options: StartOptions,
    file: Option<Arc<dyn FileModel>>,
    state: SyncState,
    synced: bool,
    ping_received: bool,
    modified: bool,
    snapshot: ContentSnapshot,
    registry: ParticipantRegistry,
    last_local_edit: Option<Instant>,
    outbox: Option<mpsc::UnboundedSender<Envelope>>,
    events: EventBus,
    closed: bool,
}

impl SessionCore {
    fn new(
        config: SessionConfig,
        identity: LocalIdentity,
        resolver: Arc<dyn IdentityResolver>,
        events: EventBus,
    ) -> Self {
        let registry = ParticipantRegistry::new(identity.id.clone(), resolver)
            .with_default_color(config.default_color);
        Self {
            config,
            identity,
            env_id: None,
            options: StartOptions::default(),
            file: None,
            state: SyncState::Disconnected,
            synced: false,
            ping_received: false,
            modified: false,
            snapshot: ContentSnapshot::default(),
            registry,
            last_local_edit: None,
            outbox: None,
            events,
            closed: false,
        }
    }

    fn bind(&mut self, file: Arc<dyn FileModel>, options: StartOptions) {
        self.env_id = Some(file.path());
        self.file = Some(file);
        self.options = options;
        self.synced = false;
        self.ping_received = false;
        if options.reset {
            self.snapshot = ContentSnapshot::default();
        }
        self.events.emit(SessionEvent::EnvUpdated(options));
        self.apply_roster(&[]);
    }

    fn attach(&mut self, outbox: mpsc::UnboundedSender<Envelope>) {
        self.outbox = Some(outbox);
    }

    fn detach(&mut self) {
        self.outbox = None;
    }

    /// Stamp and queue an envelope. Dropped unless bound and linked.
    fn send(&mut self, envelope: Envelope) -> bool {
        let Some(env_id) = self.env_id.as_deref() else {
            return false;
        };
        let action = envelope.action.clone();
        let envelope = envelope.stamp(&self.identity.id, &self.identity.token, env_id);
        match &self.outbox {
            Some(tx) if tx.send(envelope).is_ok() => true,
            _ => {
                log::debug!("No open channel, dropping {action}");
                false
            }
        }
    }

    fn set_state(&mut self, state: SyncState) {
        if self.state != state {
            self.state = state;
            self.events.emit(SessionEvent::SyncStateChanged(state));
        }
    }

    fn set_modified(&mut self, state: bool) {
        self.modified = state;
        self.events.emit(SessionEvent::Modified(state));
    }

    fn load(&mut self) {
        let Some(path) = self.env_id.clone() else {
            return;
        };
        log::info!("Loading {path}");
        self.send(Envelope::load(path));
        self.set_state(SyncState::AwaitingFullSync);
    }

    fn request_sync(&mut self) -> bool {
        self.send(Envelope::new(Action::Sync))
    }

    /// Route an inbound envelope. Patches are returned for the queue.
    fn handle_inbound(&mut self, envelope: Envelope) -> Option<PatchPayload> {
        let env_id = self.env_id.clone()?;
        log::debug!("socket receive packet {} from {}", envelope.action, envelope.from);
        self.ping_received = true;

        if envelope.environment.as_deref() != Some(env_id.as_str()) {
            return None;
        }

        if let Some(path) = envelope.path.as_deref() {
            let current = self.file.as_ref().map(|f| f.path());
            if current.as_deref() != Some(path) {
                self.events.emit(SessionEvent::FilePath(path.to_string()));
                if self.options.autoload {
                    if let Some(file) = &self.file {
                        file.stat(path);
                    }
                }
            }
        }

        let from_self = envelope.from == self.identity.id;
        let mut queued = None;
        match envelope.kind() {
            Some(Action::Cursor) if !from_self => match envelope.payload_as::<CursorPayload>() {
                Ok(payload) => {
                    if let Some(change) = self.registry.move_cursor(&envelope.from, payload.cursor) {
                        self.publish(change);
                    }
                }
                Err(e) => log::warn!("Invalid cursor payload: {e}"),
            },
            Some(Action::Select) if !from_self => match envelope.payload_as::<Selection>() {
                Ok(selection) => {
                    if let Some(change) = self.registry.move_selection(&envelope.from, selection) {
                        self.publish(change);
                    }
                }
                Err(e) => log::warn!("Invalid selection payload: {e}"),
            },
            Some(Action::Participants) => match envelope.payload_as::<RosterPayload>() {
                Ok(RosterPayload { participants: Some(list) }) => self.apply_roster(&list),
                Ok(_) => {}
                Err(e) => log::warn!("Invalid participants payload: {e}"),
            },
            Some(Action::Sync) => match envelope.payload_as::<SyncPayload>() {
                Ok(sync) => {
                    if let Some(content) = sync.content {
                        self.replace_content(content);
                        self.synced = true;
                    }
                    if let Some(list) = sync.participants {
                        self.apply_roster(&list);
                    }
                    if let Some(state) = sync.state {
                        self.set_modified(state);
                    }
                }
                Err(e) => log::warn!("Invalid sync payload: {e}"),
            },
            Some(Action::Patch) => match envelope.payload_as::<PatchPayload>() {
                Ok(payload) => queued = Some(payload),
                Err(e) => log::error!("Invalid patch data: {e}"),
            },
            Some(Action::Modified) => match envelope.payload_as::<ModifiedPayload>() {
                Ok(ModifiedPayload { state: Some(state) }) => self.set_modified(state),
                Ok(_) => {}
                Err(e) => log::warn!("Invalid modified payload: {e}"),
            },
            _ => {}
        }

        let next = if self.synced { SyncState::Stable } else { SyncState::AwaitingFullSync };
        self.set_state(next);
        queued
    }

    /// Validate and apply one remote patch against the baseline.
    fn apply_remote_patch(&mut self, payload: PatchPayload) -> PatchOutcome {
        if self.closed {
            return PatchOutcome::Discarded;
        }
        let Some(patch) = payload.into_patch() else {
            log::error!("Invalid patch data");
            return PatchOutcome::Invalid;
        };
        if patch.hash_after == self.snapshot.baseline_hash() {
            return PatchOutcome::Duplicate;
        }
        if patch.hash_before != self.snapshot.baseline_hash() {
            log::debug!(
                "Patch made against {} while baseline is {}",
                patch.hash_before,
                self.snapshot.baseline_hash()
            );
        }

        let hunks = match patch.hunks() {
            Ok(hunks) => hunks,
            Err(e) => {
                log::error!("invalid application of patch: {e}");
                self.request_sync();
                return PatchOutcome::Resync(ResyncReason::ApplyFailed);
            }
        };
        let (content, results) = codec::apply_hunks(&hunks, self.snapshot.baseline());
        if results.iter().any(|ok| !ok) {
            let applied = results.iter().filter(|ok| **ok).count();
            log::error!("invalid application of patch ({applied}/{} hunks)", results.len());
            self.request_sync();
            return PatchOutcome::Resync(ResyncReason::ApplyFailed);
        }

        let verified = codec::hash(&content) == patch.hash_after;
        if !verified && !self.within_grace() {
            log::warn!("invalid version -> resync");
            self.request_sync();
            return PatchOutcome::Resync(ResyncReason::HashMismatch);
        }

        self.set_content(content, codec::operations(&hunks));
        if verified {
            PatchOutcome::Applied
        } else {
            PatchOutcome::AppliedUnverified
        }
    }

    fn within_grace(&self) -> bool {
        self.last_local_edit
            .is_some_and(|at| at.elapsed() <= self.config.resync_grace)
    }

    fn set_content(&mut self, content: String, operations: Vec<Operation>) {
        let previous = self.snapshot.replace(content.clone());
        self.events.emit(SessionEvent::ContentChanged { content, previous, operations });
    }

    /// Wholesale replacement from a full sync.
    fn replace_content(&mut self, content: String) {
        if content == self.snapshot.baseline() {
            self.snapshot.replace(content);
            return;
        }
        let operations = codec::operations(&codec::make_hunks(self.snapshot.baseline(), &content));
        self.set_content(content, operations);
    }

    fn update_content(&mut self, value: String) -> Option<Patch> {
        if value == self.snapshot.baseline() {
            return None;
        }
        self.snapshot.observe(value);
        let patch = self.snapshot.commit();
        self.last_local_edit = Some(Instant::now());
        self.send(Envelope::patch(&patch));
        self.set_modified(true);
        Some(patch)
    }

    fn heartbeat(&mut self) {
        if self.closed || self.outbox.is_none() {
            return;
        }
        if !self.synced {
            self.request_sync();
            return;
        }
        self.send(Envelope::new(Action::Ping));
        let next = if self.ping_received { SyncState::Stable } else { SyncState::Syncing };
        self.set_state(next);
        self.ping_received = false;
    }

    fn on_transport_closed(&mut self) {
        log::info!("socket disconnect");
        self.detach();
        self.set_state(SyncState::Disconnected);
        self.events
            .emit(SessionEvent::Error(SessionError::Transport(TransportError::ChannelClosed)));
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.send(Envelope::new(Action::Close));
        self.detach();
        self.closed = true;
        self.set_state(SyncState::Disconnected);
        self.events.emit(SessionEvent::Closed);
        self.events.clear();
    }

    fn apply_roster(&mut self, entries: &[RosterEntry]) {
        let update = self.registry.set_roster(entries);
        self.events.emit(SessionEvent::ParticipantsChanged(update.delta));
        for change in update.changes {
            self.publish(change);
        }
    }

    fn publish(&self, change: PresenceChange) {
        let event = match change {
            PresenceChange::CursorMoved { user_id, cursor } => {
                SessionEvent::CursorMoved { user_id, cursor }
            }
            PresenceChange::SelectionMoved { user_id, selection } => {
                SessionEvent::SelectionMoved { user_id, selection }
            }
            PresenceChange::CursorRemoved { user_id } => SessionEvent::CursorRemoved { user_id },
            PresenceChange::SelectionRemoved { user_id } => {
                SessionEvent::SelectionRemoved { user_id }
            }
        };
        self.events.emit(event);
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

/// Tasks belonging to one open channel. Dropping aborts them.
struct Link {
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
    queue: Arc<PatchQueue<PatchPayload>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.heartbeat.abort();
        self.queue.close();
        self.reader.abort();
    }
}

/// Keeps one editor's content in sync with the backend.
pub struct SyncSession<C> {
    config: SessionConfig,
    core: Arc<Mutex<SessionCore>>,
    connection: Arc<Connection<C>>,
    events: EventBus,
    link: Option<Link>,
    closed: bool,
}

impl<C: Connector> SyncSession<C> {
    pub fn new(
        config: SessionConfig,
        identity: LocalIdentity,
        connector: C,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        let events = EventBus::new();
        let connection = Arc::new(Connection::new(connector, config.connect_timeout));
        let core = SessionCore::new(config.clone(), identity, resolver, events.clone());
        Self {
            config,
            core: Arc::new(Mutex::new(core)),
            connection,
            events,
            link: None,
            closed: false,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Bind to `file`, connect, and request its content.
    ///
    /// If the session is already bound, the previous environment is sent
    /// a `close` and its link is torn down first. A connect failure is
    /// emitted as [`SessionEvent::Error`] and returned.
    pub async fn start(
        &mut self,
        file: Arc<dyn FileModel>,
        options: StartOptions,
    ) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if file.is_buffer() {
            return Err(SessionError::InvalidFile(file.path()));
        }

        if let Some(link) = self.link.take() {
            let mut core = self.core.lock().await;
            core.send(Envelope::new(Action::Close));
            core.detach();
            drop(link);
            self.connection.close();
        }

        log::info!("Starting sync for {}", file.path());
        self.core.lock().await.bind(file, options);

        let inbound = match self.connect().await {
            Ok(inbound) => inbound,
            Err(e) => {
                log::error!("Connection failed: {e}");
                let mut core = self.core.lock().await;
                core.set_state(SyncState::Disconnected);
                let err = SessionError::Transport(e);
                core.events.emit(SessionEvent::Error(err.clone()));
                return Err(err);
            }
        };

        self.link = Some(self.spawn_link(inbound));
        self.core.lock().await.load();
        Ok(())
    }

    /// Rebind to another file; same as [`start`](Self::start).
    pub async fn switch_file(
        &mut self,
        file: Arc<dyn FileModel>,
        options: StartOptions,
    ) -> Result<(), SessionError> {
        self.start(file, options).await
    }

    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<Envelope>, TransportError> {
        let inbound = self.connection.open().await?;
        let outbox = self.connection.sender().await?;
        self.core.lock().await.attach(outbox);
        Ok(inbound)
    }

    fn spawn_link(&self, mut inbound: mpsc::UnboundedReceiver<Envelope>) -> Link {
        let queue_core = self.core.clone();
        let queue = Arc::new(PatchQueue::new(move |payload: PatchPayload| {
            let core = queue_core.clone();
            async move {
                let outcome = core.lock().await.apply_remote_patch(payload);
                log::debug!("Patch outcome: {outcome:?}");
            }
        }));

        let core = self.core.clone();
        let connection = self.connection.clone();
        let reader_queue = queue.clone();
        let reader = tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                let mut core = core.lock().await;
                if let Some(payload) = core.handle_inbound(envelope) {
                    reader_queue.defer(payload);
                }
            }
            connection.close();
            core.lock().await.on_transport_closed();
        });

        let core = self.core.clone();
        let period = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                core.lock().await.heartbeat();
            }
        });

        Link { reader, heartbeat, queue }
    }

    /// Report new local content. Returns the patch sent, or `None` when
    /// the content equals the baseline.
    pub async fn update_content(&self, content: impl Into<String>) -> Option<Patch> {
        if self.closed {
            return None;
        }
        self.core.lock().await.update_content(content.into())
    }

    pub async fn update_cursor(&self, position: Position) -> bool {
        !self.closed && self.core.lock().await.send(Envelope::cursor(position))
    }

    pub async fn update_selection(&self, selection: Selection) -> bool {
        !self.closed && self.core.lock().await.send(Envelope::select(selection))
    }

    /// Ask the server to persist the document. `args` must be a JSON object.
    pub async fn save(&self, args: Value) -> bool {
        !self.closed && self.core.lock().await.send(Envelope::with_fields(Action::Save, args))
    }

    /// Ask for the authoritative content.
    pub async fn request_sync(&self) -> bool {
        !self.closed && self.core.lock().await.request_sync()
    }

    pub async fn state(&self) -> SyncState {
        self.core.lock().await.state
    }

    pub async fn is_synced(&self) -> bool {
        self.core.lock().await.synced
    }

    pub async fn is_modified(&self) -> bool {
        self.core.lock().await.modified
    }

    /// The baseline content.
    pub async fn content(&self) -> String {
        self.core.lock().await.snapshot.baseline().to_string()
    }

    pub async fn snapshot(&self) -> ContentSnapshot {
        self.core.lock().await.snapshot.clone()
    }

    pub async fn env_id(&self) -> Option<String> {
        self.core.lock().await.env_id.clone()
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.core.lock().await.registry.participants().to_vec()
    }

    pub async fn remote_cursor(&self, user_id: &str) -> Option<RemoteCursor> {
        self.core.lock().await.registry.cursor(user_id).cloned()
    }

    pub async fn remote_selection(&self, user_id: &str) -> Option<RemoteSelection> {
        self.core.lock().await.registry.selection(user_id).cloned()
    }

    pub async fn color_for(&self, user_id: &str) -> CursorColor {
        self.core.lock().await.registry.color_for(user_id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Stop the link tasks, notify the server, drop every listener.
    /// Terminal.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.link.take();
        self.core.lock().await.close();
        self.connection.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
