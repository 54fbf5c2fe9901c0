//! WebSocket relay with one room per environment.
//!
//! Architecture:
//! ```text
//! Session A ──┐                       ┌── content (authoritative)
//!             ├── Room (env id) ──────┼── modified flag
//! Session B ──┘                       └── BroadcastGroup
//!                                            │
//!                              ┌─────────────┼─────────────┐
//!                              ▼             ▼             ▼
//!                          Session A     Session B     Session C
//!                         (own frames skipped)
//! ```
//!
//! The relay applies incoming patches to its copy of the content with the
//! same codec the sessions use, forwards accepted patches verbatim to the
//! other peers, and answers a patch it cannot apply with an authoritative
//! `sync`. Rooms live for the lifetime of the process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame, PeerSlot};
use crate::codec;
use crate::position::Selection;
use crate::protocol::{Action, CursorPayload, Envelope, ModifiedPayload, PatchPayload};

/// `from` field of envelopes the relay originates.
pub const RELAY_ID: &str = "relay";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9091".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub patches_applied: u64,
    pub patches_rejected: u64,
}

/// One environment: authoritative content and its peers.
struct Room {
    content: String,
    modified: bool,
    group: Arc<BroadcastGroup>,
}

impl Room {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            content: String::new(),
            modified: false,
            group: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }
}

/// Relay-side state of one connection.
pub struct PeerConnection {
    conn_id: Uuid,
    user_id: String,
    env_id: Option<String>,
    frames: Option<broadcast::Receiver<Frame>>,
}

impl PeerConnection {
    pub fn new() -> Self {
        Self { conn_id: Uuid::new_v4(), user_id: String::new(), env_id: None, frames: None }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// The room this connection is attached to.
    pub fn env_id(&self) -> Option<&str> {
        self.env_id.as_deref()
    }

    /// Frames broadcast in the current room, the connection's own included.
    pub fn frames(&mut self) -> Option<&mut broadcast::Receiver<Frame>> {
        self.frames.as_mut()
    }
}

impl Default for PeerConnection {
    fn default() -> Self {
        Self::new()
    }
}

/// The relay server. Clones share rooms and stats.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept WebSocket connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Sync relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut peer = PeerConnection::new();
        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match Envelope::decode(text.as_str()) {
                                Ok(envelope) => {
                                    for reply in self.process(&mut peer, envelope).await {
                                        ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                                    }
                                }
                                Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    },

                    frame = async {
                        match peer.frames() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => match frame {
                        Ok(frame) => {
                            // Don't echo back to sender
                            if frame.origin == peer.conn_id {
                                continue;
                            }
                            ws_sender.send(Message::Text(frame.text.as_str().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {} lagged by {n} frames", peer.conn_id);
                            if let Some(group) = self.group_of(&peer).await {
                                group.record_dropped(n);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => peer.frames = None,
                    },
                }
            }
            Ok(())
        }
        .await;

        self.leave(&mut peer).await;
        self.stats.write().await.active_connections -= 1;
        result
    }

    /// Handle one envelope from `peer`; returns the direct replies.
    ///
    /// Fan-out to the other peers of the room happens here too.
    pub async fn process(&self, peer: &mut PeerConnection, envelope: Envelope) -> Vec<Envelope> {
        let Some(action) = envelope.kind() else {
            log::debug!("Ignoring unknown action {}", envelope.action);
            return Vec::new();
        };
        if !envelope.from.is_empty() {
            peer.user_id = envelope.from.clone();
        }

        if action == Action::Load {
            return self.join(peer, &envelope).await;
        }
        let Some(env_id) = peer.env_id.clone() else {
            log::debug!("{action} before load, ignoring");
            return Vec::new();
        };

        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&env_id) else {
            return Vec::new();
        };

        match action {
            Action::Sync => vec![Self::full_sync(room, &env_id).await],
            Action::Ping => vec![Envelope::new(Action::Ping).stamp(RELAY_ID, "", &env_id)],
            Action::Patch => {
                let Some(patch) = envelope.payload_as::<PatchPayload>().ok().and_then(PatchPayload::into_patch) else {
                    log::warn!("Invalid patch from {}", peer.user_id);
                    return Vec::new();
                };
                if codec::hash(&room.content) == patch.hash_after {
                    return Vec::new();
                }
                let (content, ok) = codec::apply(&patch, &room.content);
                if !ok {
                    log::warn!("Rejected patch from {} on {env_id}", peer.user_id);
                    self.stats.write().await.patches_rejected += 1;
                    return vec![Self::full_sync(room, &env_id).await];
                }
                // Applied on top of a concurrent edit: keep the merge and
                // push it to the whole room, origin included.
                let merged = codec::hash(&content) != patch.hash_after;
                room.content = content;
                room.modified = true;
                self.stats.write().await.patches_applied += 1;
                Self::forward(&room.group, peer.conn_id, &envelope);
                if merged {
                    log::debug!("Merged concurrent patch from {} on {env_id}", peer.user_id);
                    let sync = Self::full_sync(room, &env_id).await;
                    Self::forward(&room.group, Uuid::nil(), &sync);
                }
                Vec::new()
            }
            Action::Cursor => {
                if let Ok(payload) = envelope.payload_as::<CursorPayload>() {
                    room.group.update_peer(&peer.conn_id, |p| p.cursor = payload.cursor).await;
                    Self::forward(&room.group, peer.conn_id, &envelope);
                }
                Vec::new()
            }
            Action::Select => {
                if let Ok(selection) = envelope.payload_as::<Selection>() {
                    room.group.update_peer(&peer.conn_id, |p| p.selection = selection).await;
                    Self::forward(&room.group, peer.conn_id, &envelope);
                }
                Vec::new()
            }
            Action::Modified => {
                if let Ok(ModifiedPayload { state: Some(state) }) = envelope.payload_as() {
                    room.modified = state;
                    Self::forward(&room.group, peer.conn_id, &envelope);
                }
                Vec::new()
            }
            Action::Save => {
                log::info!("Save requested for {env_id} by {}", peer.user_id);
                room.modified = false;
                let saved = Envelope::modified(false).stamp(RELAY_ID, "", &env_id);
                Self::forward(&room.group, Uuid::nil(), &saved);
                Vec::new()
            }
            Action::Close => {
                drop(rooms);
                self.leave(peer).await;
                Vec::new()
            }
            Action::Participants | Action::Load => Vec::new(),
        }
    }

    async fn join(&self, peer: &mut PeerConnection, envelope: &Envelope) -> Vec<Envelope> {
        let Some(env_id) = envelope.environment.clone().or_else(|| envelope.path.clone()) else {
            log::warn!("load without environment from {}", peer.user_id);
            return Vec::new();
        };
        if peer.env_id.is_some() {
            self.leave(peer).await;
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(env_id.clone())
            .or_insert_with(|| Room::new(self.config.broadcast_capacity));
        if room.group.peer_count().await >= self.config.max_peers_per_room {
            log::warn!("Room {env_id} is full, refusing {}", peer.user_id);
            return Vec::new();
        }

        let rx = room.group.add_peer(PeerSlot::new(peer.conn_id, peer.user_id.clone())).await;
        peer.frames = Some(rx);
        peer.env_id = Some(env_id.clone());
        log::info!("Peer {} joined room {env_id}", peer.user_id);

        let reply = Self::full_sync(room, &env_id).await;
        let roster = room.group.roster().await;
        let announce = Envelope::participants(&roster).stamp(RELAY_ID, "", &env_id);
        Self::forward(&room.group, peer.conn_id, &announce);

        let room_count = rooms.len();
        drop(rooms);
        self.stats.write().await.active_rooms = room_count;
        vec![reply]
    }

    /// Detach `peer` from its room and push the new roster.
    async fn leave(&self, peer: &mut PeerConnection) {
        let Some(env_id) = peer.env_id.take() else {
            return;
        };
        peer.frames = None;

        let rooms = self.rooms.read().await;
        if let Some(room) = rooms.get(&env_id) {
            room.group.remove_peer(&peer.conn_id).await;
            let roster = room.group.roster().await;
            let announce = Envelope::participants(&roster).stamp(RELAY_ID, "", &env_id);
            Self::forward(&room.group, peer.conn_id, &announce);
            log::info!("Peer {} left room {env_id}", peer.user_id);
        }
    }

    async fn full_sync(room: &Room, env_id: &str) -> Envelope {
        let roster = room.group.roster().await;
        Envelope::sync(Some(&room.content), Some(&roster), Some(room.modified))
            .stamp(RELAY_ID, "", env_id)
    }

    fn forward(group: &BroadcastGroup, origin: Uuid, envelope: &Envelope) {
        if let Err(e) = group.broadcast(origin, envelope) {
            log::error!("Failed to broadcast {}: {e}", envelope.action);
        }
    }

    async fn group_of(&self, peer: &PeerConnection) -> Option<Arc<BroadcastGroup>> {
        let env_id = peer.env_id.as_deref()?;
        self.rooms.read().await.get(env_id).map(|r| r.group.clone())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Current authoritative content of a room.
    pub async fn room_content(&self, env_id: &str) -> Option<String> {
        self.rooms.read().await.get(env_id).map(|r| r.content.clone())
    }

    pub async fn room_modified(&self, env_id: &str) -> Option<bool> {
        self.rooms.read().await.get(env_id).map(|r| r.modified)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
