//! Error types for every layer of the sync engine.
//!
//! Only transport failures are fatal to a session. Patch application
//! failures and hash mismatches never surface here: the session recovers
//! from them by requesting a full resync.

/// Failures of the duplex channel between a session and the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel did not open within the connect timeout.
    ConnectTimeout,
    /// The connector reported an error while opening the channel.
    ConnectFailed(String),
    /// The channel was closed by either side.
    ChannelClosed,
    /// An envelope could not be serialized.
    Encode(String),
    /// A frame could not be parsed into an envelope.
    Decode(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectTimeout => write!(f, "Timeout when connecting to synchronization backend"),
            Self::ConnectFailed(e) => write!(f, "Connection failed: {e}"),
            Self::ChannelClosed => write!(f, "Connection closed"),
            Self::Encode(e) => write!(f, "Serialization error: {e}"),
            Self::Decode(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors raised while parsing serialized patch text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A hunk header or segment line does not follow the patch grammar.
    MalformedHunk(String),
    /// Segment text is not valid percent-encoded UTF-8.
    InvalidEscape(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedHunk(line) => write!(f, "Malformed patch hunk: {line}"),
            Self::InvalidEscape(e) => write!(f, "Invalid escape in patch text: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors surfaced by a [`SyncSession`](crate::session::SyncSession).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Transport failure; fatal to the current session.
    Transport(TransportError),
    /// The file cannot be synchronized (e.g. a temporary buffer).
    InvalidFile(String),
    /// The operation needs a bound file.
    NotBound,
    /// The session was closed and accepts no further transitions.
    Closed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::InvalidFile(reason) => write!(f, "Invalid file: {reason}"),
            Self::NotBound => write!(f, "Session is not bound to a file"),
            Self::Closed => write!(f, "Session is closed"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}
