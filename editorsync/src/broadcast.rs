//! Fan-out of encoded envelopes to the peers of one room.
//!
//! Uses a tokio broadcast channel: one send reaches every subscriber, and
//! each peer's receiver buffers up to `capacity` frames before it lags.
//! Frames carry their origin connection so a peer can skip its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::TransportError;
use crate::position::{Position, Selection};
use crate::protocol::{Envelope, RosterEntry};

/// An encoded envelope and the connection it came from.
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: Uuid,
    pub text: Arc<String>,
}

/// A connection attached to a room, with its last known presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSlot {
    pub conn_id: Uuid,
    pub user_id: String,
    pub cursor: Position,
    pub selection: Selection,
}

impl PeerSlot {
    pub fn new(conn_id: Uuid, user_id: impl Into<String>) -> Self {
        Self {
            conn_id,
            user_id: user_id.into(),
            cursor: Position::ORIGIN,
            selection: Selection::default(),
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    /// Attached peers, in join order.
    peers: RwLock<Vec<PeerSlot>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a slow peer may fall behind before
    /// it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(Vec::new()),
            capacity,
            stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Attach a peer, replacing any slot with the same connection id.
    pub async fn add_peer(&self, slot: PeerSlot) -> broadcast::Receiver<Frame> {
        let mut peers = self.peers.write().await;
        peers.retain(|p| p.conn_id != slot.conn_id);
        peers.push(slot);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, conn_id: &Uuid) -> Option<PeerSlot> {
        let mut peers = self.peers.write().await;
        let idx = peers.iter().position(|p| p.conn_id == *conn_id)?;
        Some(peers.remove(idx))
    }

    /// Mutate a peer's slot in place. Returns whether the peer exists.
    pub async fn update_peer<F: FnOnce(&mut PeerSlot)>(&self, conn_id: &Uuid, f: F) -> bool {
        let mut peers = self.peers.write().await;
        match peers.iter_mut().find(|p| p.conn_id == *conn_id) {
            Some(slot) => {
                f(slot);
                true
            }
            None => false,
        }
    }

    /// Encode once and send to every subscriber, the origin included.
    /// Receivers filter their own frames.
    pub fn broadcast(&self, origin: Uuid, envelope: &Envelope) -> Result<usize, TransportError> {
        let text = Arc::new(envelope.encode()?);
        Ok(self.broadcast_raw(Frame { origin, text }))
    }

    /// Send an already encoded frame.
    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, conn_id: &Uuid) -> bool {
        self.peers.read().await.iter().any(|p| p.conn_id == *conn_id)
    }

    pub async fn peers(&self) -> Vec<PeerSlot> {
        self.peers.read().await.clone()
    }

    /// Roster as sent on the wire; one entry per user, first slot wins.
    pub async fn roster(&self) -> Vec<RosterEntry> {
        let peers = self.peers.read().await;
        let mut roster: Vec<RosterEntry> = Vec::with_capacity(peers.len());
        for p in peers.iter() {
            if roster.iter().any(|e| e.user_id == p.user_id) {
                continue;
            }
            roster.push(RosterEntry {
                user_id: p.user_id.clone(),
                cursor: p.cursor,
                selection: p.selection,
            });
        }
        roster
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }
}
