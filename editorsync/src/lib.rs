//! # editorsync — real-time text synchronization for editors
//!
//! Keeps one editor buffer in sync with a relay and the other participants
//! editing the same file, using diff/patch exchange validated by content
//! hashes, with a full-content resync as the fallback.
//!
//! ## Architecture
//!
//! ```text
//!  editor binding
//!     │ update_content / update_cursor        ▲ SessionEvent
//!     ▼                                       │
//! ┌──────────────┐  diff   ┌──────────┐   ┌───┴──────┐
//! │ SyncSession  │ ──────► │  codec   │   │ EventBus │
//! │ (state mach.)│ ◄─────  │ (patch)  │   └──────────┘
//! └──┬────────┬──┘  apply  └──────────┘
//!    │        │ patches           ┌──────────────────────┐
//!    │        └─────────────────► │ PatchQueue (FIFO, 1) │
//!    │ Envelope (JSON)            └──────────────────────┘
//!    ▼
//! ┌──────────────┐   WebSocket   ┌──────────────┐
//! │  Connection  │ ◄───────────► │  SyncServer  │ ── room per file
//! └──────────────┘               └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — diff, patch text, apply, operations, CRC-32 hashes
//! - [`position`] — offset ↔ (x, y) mapping and cursor shifting
//! - [`participants`] — roster, remote cursors/selections, colors
//! - [`queue`] — strictly sequential patch processing
//! - [`session`] — the sync state machine
//! - [`events`] — typed event bus
//! - [`protocol`] — JSON envelopes and payload views
//! - [`transport`] — connection state machine, WebSocket and in-memory channels
//! - [`broadcast`] / [`server`] — the relay

pub mod broadcast;
pub mod codec;
pub mod error;
pub mod events;
pub mod participants;
pub mod position;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use codec::{Operation, OperationKind, Patch};
pub use error::{CodecError, SessionError, TransportError};
pub use events::{EventBus, EventKind, SessionEvent, SubscriptionId};
pub use participants::{
    CursorColor, Directory, IdentityResolver, Participant, ParticipantRegistry, RemoteCursor,
    RemoteSelection, RosterDelta, UserProfile,
};
pub use position::{Position, Selection};
pub use protocol::{Action, Envelope, RosterEntry};
pub use queue::PatchQueue;
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{
    ContentSnapshot, FileModel, LocalIdentity, PatchOutcome, ResyncReason, SessionConfig,
    StartOptions, SyncSession, SyncState,
};
pub use transport::{
    memory_pair, Connection, ConnectionState, Connector, MemoryConnector, MemoryPeer,
    WebSocketConnector,
};
