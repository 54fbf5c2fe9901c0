//! JSON envelope protocol shared by sessions and the relay.
//!
//! Wire format (one JSON object per frame):
//! ```text
//! ┌────────┬────────┬────────┬─────────────┬────────┬─────────────────┐
//! │ action │ from   │ token  │ environment │ path?  │ action payload… │
//! │ string │ user   │ string │ file id     │ string │ flattened       │
//! └────────┴────────┴────────┴─────────────┴────────┴─────────────────┘
//! ```
//!
//! | action       | payload                                   |
//! |--------------|-------------------------------------------|
//! | load         | `path`                                    |
//! | sync         | `content?`, `participants?`, `state?`     |
//! | patch        | `patch`, `hashs: { before, after }`       |
//! | cursor       | `cursor: { x, y }`                        |
//! | select       | `start: { x, y }`, `end: { x, y }`        |
//! | participants | `participants: [...]`                     |
//! | modified     | `state`                                   |
//! | ping / close | none                                      |
//! | save         | arbitrary                                 |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::codec::Patch;
use crate::error::TransportError;
use crate::position::{Position, Selection};

/// Protocol actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Load,
    Sync,
    Patch,
    Cursor,
    Select,
    Participants,
    Ping,
    Modified,
    Close,
    Save,
}

impl Action {
    pub const ALL: [Action; 10] = [
        Action::Load,
        Action::Sync,
        Action::Patch,
        Action::Cursor,
        Action::Select,
        Action::Participants,
        Action::Ping,
        Action::Modified,
        Action::Close,
        Action::Save,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Sync => "sync",
            Self::Patch => "patch",
            Self::Cursor => "cursor",
            Self::Select => "select",
            Self::Participants => "participants",
            Self::Ping => "ping",
            Self::Modified => "modified",
            Self::Close => "close",
            Self::Save => "save",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level protocol message.
///
/// Unknown actions are kept as raw strings so peers can ignore them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Action-specific fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope with no payload.
    pub fn new(action: Action) -> Self {
        Self {
            action: action.as_str().to_string(),
            from: String::new(),
            token: String::new(),
            environment: None,
            path: None,
            payload: Map::new(),
        }
    }

    /// Create an envelope whose payload is the fields of a JSON object.
    ///
    /// Non-object values leave the payload empty.
    pub fn with_fields(action: Action, fields: Value) -> Self {
        let mut env = Self::new(action);
        if let Value::Object(map) = fields {
            env.payload = map;
        }
        env
    }

    /// Request to attach to a file.
    pub fn load(path: impl Into<String>) -> Self {
        let mut env = Self::new(Action::Load);
        env.path = Some(path.into());
        env
    }

    /// Incremental change.
    pub fn patch(patch: &Patch) -> Self {
        Self::with_fields(
            Action::Patch,
            json!({
                "patch": patch.diff_text,
                "hashs": { "before": patch.hash_before, "after": patch.hash_after },
            }),
        )
    }

    /// Authoritative full state; every part is optional.
    pub fn sync(content: Option<&str>, participants: Option<&[RosterEntry]>, state: Option<bool>) -> Self {
        let mut fields = Map::new();
        if let Some(content) = content {
            fields.insert("content".into(), Value::String(content.to_string()));
        }
        if let Some(participants) = participants {
            fields.insert("participants".into(), json!(participants));
        }
        if let Some(state) = state {
            fields.insert("state".into(), Value::Bool(state));
        }
        Self::with_fields(Action::Sync, Value::Object(fields))
    }

    pub fn cursor(position: Position) -> Self {
        Self::with_fields(Action::Cursor, json!({ "cursor": position }))
    }

    pub fn select(selection: Selection) -> Self {
        Self::with_fields(Action::Select, json!(selection))
    }

    pub fn participants(roster: &[RosterEntry]) -> Self {
        Self::with_fields(Action::Participants, json!({ "participants": roster }))
    }

    pub fn modified(state: bool) -> Self {
        Self::with_fields(Action::Modified, json!({ "state": state }))
    }

    /// Fill in sender identity and target environment.
    pub fn stamp(mut self, from: &str, token: &str, environment: &str) -> Self {
        self.from = from.to_string();
        self.token = token.to_string();
        self.environment = Some(environment.to_string());
        self
    }

    /// The parsed action, if it is one this protocol knows.
    pub fn kind(&self) -> Option<Action> {
        Action::parse(&self.action)
    }

    /// Decode the payload into a typed view.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Encode(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// Hashes carried by a patch message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHashes {
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub after: String,
}

/// Payload of a `patch` message, as received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPayload {
    #[serde(default)]
    pub patch: String,
    #[serde(default)]
    pub hashs: Option<PatchHashes>,
}

impl PatchPayload {
    /// Validate into a [`Patch`]; `None` if the patch text or a hash is missing.
    pub fn into_patch(self) -> Option<Patch> {
        let hashs = self.hashs?;
        if self.patch.is_empty() || hashs.before.is_empty() || hashs.after.is_empty() {
            return None;
        }
        Some(Patch {
            diff_text: self.patch,
            hash_before: hashs.before,
            hash_after: hashs.after,
        })
    }
}

/// One participant as listed in a roster push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub user_id: String,
    #[serde(default)]
    pub cursor: Position,
    #[serde(default)]
    pub selection: Selection,
}

impl RosterEntry {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), ..Self::default() }
    }
}

/// Payload of a `sync` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub participants: Option<Vec<RosterEntry>>,
    #[serde(default)]
    pub state: Option<bool>,
}

/// Payload of a `participants` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterPayload {
    #[serde(default)]
    pub participants: Option<Vec<RosterEntry>>,
}

/// Payload of a `cursor` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPayload {
    pub cursor: Position,
}

/// Payload of a `modified` message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedPayload {
    #[serde(default)]
    pub state: Option<bool>,
}
