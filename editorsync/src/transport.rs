//! Message-oriented duplex channels to the sync backend.
//!
//! ```text
//!            Connection::open()
//!  Idle ──► Connecting ──► Open ──► Closed
//!               │                     ▲
//!               └── timeout / error ──┘
//! ```
//!
//! A [`Connector`] produces a [`Channel`]: an outbound envelope sender
//! and an inbound envelope receiver. The inbound stream ending is the
//! channel's `close` event.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::protocol::Envelope;

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// An open duplex channel.
#[derive(Debug)]
pub struct Channel {
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

/// Opens channels to the backend.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<Channel, TransportError>> + Send;
}

/// Connection state machine around a [`Connector`].
///
/// `open()` is bounded by the connect timeout and can be cancelled by a
/// concurrent `close()`. The outbound half of an open channel is cached
/// and handed out by `sender()`.
pub struct Connection<C> {
    connector: C,
    timeout: Duration,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
}

impl<C: Connector> Connection<C> {
    pub fn new(connector: C, timeout: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self { connector, timeout, state, outbound: Mutex::new(None) }
    }

    /// Open a channel and return its inbound half.
    pub async fn open(&self) -> Result<mpsc::UnboundedReceiver<Envelope>, TransportError> {
        self.state.send_replace(ConnectionState::Connecting);
        let mut state_rx = self.state.subscribe();

        let result = tokio::select! {
            res = tokio::time::timeout(self.timeout, self.connector.connect()) => match res {
                Ok(res) => res,
                Err(_) => Err(TransportError::ConnectTimeout),
            },
            _ = state_rx.wait_for(|s| *s == ConnectionState::Closed) => Err(TransportError::ChannelClosed),
        };

        match result {
            Ok(channel) => {
                *self.slot() = Some(channel.outbound);
                self.state.send_replace(ConnectionState::Open);
                Ok(channel.inbound)
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    /// The cached outbound sender, waiting for a pending open to finish.
    pub async fn sender(&self) -> Result<mpsc::UnboundedSender<Envelope>, TransportError> {
        let mut state_rx = self.state.subscribe();
        let settled = tokio::time::timeout(
            self.timeout,
            state_rx.wait_for(|s| *s != ConnectionState::Connecting),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout)?
        .map(|s| *s)
        .map_err(|_| TransportError::ChannelClosed)?;

        if settled != ConnectionState::Open {
            return Err(TransportError::ChannelClosed);
        }
        self.slot().clone().ok_or(TransportError::ChannelClosed)
    }

    /// Drop the outbound half and mark the connection closed.
    pub fn close(&self) {
        self.slot().take();
        self.state.send_replace(ConnectionState::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Envelope>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ───────────────────────────────────────────────────────────────────
// WebSocket
// ───────────────────────────────────────────────────────────────────

/// JSON-over-WebSocket connector (one envelope per text frame).
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Channel, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();

        // Writer task: drains outbound envelopes, closes the socket once
        // every sender is gone.
        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let text = match envelope.encode() {
                    Ok(t) => t,
                    Err(e) => {
                        log::error!("Dropping outbound {}: {e}", envelope.action);
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decodes frames; dropping `in_tx` signals close.
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Envelope::decode(text.as_str()) {
                        Ok(envelope) => {
                            if in_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok(Channel { outbound: out_tx, inbound: in_rx })
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory
// ───────────────────────────────────────────────────────────────────

/// In-memory connector handing out pre-built channels, one per `connect`.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    channels: Arc<Mutex<VecDeque<Channel>>>,
}

/// The far end of a [`MemoryConnector`] channel: what the "server" sees.
#[derive(Debug)]
pub struct MemoryPeer {
    /// Envelopes sent by the session.
    pub received: mpsc::UnboundedReceiver<Envelope>,
    /// Envelopes delivered to the session. Dropped by `hang_up`.
    pub sender: Option<mpsc::UnboundedSender<Envelope>>,
}

/// Create a connector with one channel ready, and its peer.
pub fn memory_pair() -> (MemoryConnector, MemoryPeer) {
    let connector = MemoryConnector::default();
    let peer = connector.add_peer();
    (connector, peer)
}

impl MemoryConnector {
    /// A connector whose `connect` never completes.
    pub fn unreachable() -> Self {
        Self::default()
    }

    /// Queue another channel for the next `connect` and return its peer.
    pub fn add_peer(&self) -> MemoryPeer {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Channel { outbound: out_tx, inbound: in_rx });
        MemoryPeer { received: out_rx, sender: Some(in_tx) }
    }
}

impl Connector for MemoryConnector {
    /// Pops the next queued channel; pends forever when none is left.
    async fn connect(&self) -> Result<Channel, TransportError> {
        let channel = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match channel {
            Some(channel) => Ok(channel),
            None => std::future::pending().await,
        }
    }
}

impl MemoryPeer {
    /// Deliver an envelope to the session.
    pub fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.sender
            .as_ref()
            .ok_or(TransportError::ChannelClosed)?
            .send(envelope)
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Next envelope sent by the session.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.received.recv().await
    }

    /// Everything sent so far, without waiting.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.received.try_recv() {
            out.push(envelope);
        }
        out
    }

    /// Close the session's inbound stream.
    pub fn hang_up(&mut self) {
        self.sender.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Action;

    #[tokio::test]
    async fn test_open_memory_channel() {
        let (connector, mut peer) = memory_pair();
        let conn = Connection::new(connector, Duration::from_secs(5));
        assert_eq!(conn.state(), ConnectionState::Idle);

        let mut inbound = conn.open().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);

        conn.sender().await.unwrap().send(Envelope::new(Action::Ping)).unwrap();
        assert_eq!(peer.recv().await.unwrap().kind(), Some(Action::Ping));

        peer.send(Envelope::new(Action::Sync)).unwrap();
        assert_eq!(inbound.recv().await.unwrap().kind(), Some(Action::Sync));

        peer.hang_up();
        assert!(inbound.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_times_out() {
        let conn = Connection::new(MemoryConnector::unreachable(), Duration::from_secs(5));
        let err = conn.open().await.unwrap_err();
        assert_eq!(err, TransportError::ConnectTimeout);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.sender().await.unwrap_err(), TransportError::ChannelClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_open() {
        let conn = Arc::new(Connection::new(MemoryConnector::unreachable(), Duration::from_secs(5)));
        let opener = conn.clone();
        let handle = tokio::spawn(async move { opener.open().await.map(|_| ()) });

        let mut watch = conn.watch();
        watch.wait_for(|s| *s == ConnectionState::Connecting).await.unwrap();
        conn.close();

        assert_eq!(handle.await.unwrap(), Err(TransportError::ChannelClosed));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_sender_after_close_fails() {
        let (connector, _peer) = memory_pair();
        let conn = Connection::new(connector, Duration::from_secs(5));
        conn.open().await.unwrap();
        conn.close();
        assert_eq!(conn.sender().await.unwrap_err(), TransportError::ChannelClosed);
    }

    #[tokio::test]
    async fn test_peer_drain_and_hang_up() {
        let (connector, mut peer) = memory_pair();
        let channel = connector.connect().await.unwrap();
        channel.outbound.send(Envelope::new(Action::Ping)).unwrap();
        channel.outbound.send(Envelope::new(Action::Close)).unwrap();
        assert_eq!(peer.drain().len(), 2);

        peer.hang_up();
        assert_eq!(peer.send(Envelope::new(Action::Sync)), Err(TransportError::ChannelClosed));
    }
}
