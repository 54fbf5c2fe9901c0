//! Participant roster and presence (remote cursors and selections).
//!
//! ## Flow
//!
//! ```text
//! roster push (participants / sync)
//!       │
//!       ▼
//! ParticipantRegistry::set_roster()  ── IdentityResolver::resolve()
//!       │
//!       ├── RosterDelta { added, removed, refreshed, unresolved }
//!       └── PresenceChange* (removals, then a republish per participant)
//!
//! cursor / select message
//!       │
//!       ▼
//! ParticipantRegistry::move_cursor() / move_selection()
//!       └── PresenceChange
//! ```
//!
//! The registry has no UI coupling: callers observe it only through the
//! returned deltas and changes.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::position::{Position, Selection};
use crate::protocol::RosterEntry;

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGB color for cursor/selection rendering, written as `#rrggbb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl CursorColor {
    /// Fallback for participants without a resolved profile.
    pub const FALLBACK: CursorColor = CursorColor { r: 0xff, g: 0x00, b: 0x00 };

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Stable, vivid color derived from a user id.
    ///
    /// The hue comes from the id's hash; saturation and lightness are fixed.
    pub fn from_user_id(user_id: &str) -> Self {
        let hue = (crc32fast::hash(user_id.as_bytes()) % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        let channel = |v: f32| (v * 255.0).round().clamp(0.0, 255.0) as u8;
        Self { r: channel(r), g: channel(g), b: channel(b) }
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self::FALLBACK
    }
}

impl std::fmt::Display for CursorColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl FromStr for CursorColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(format!("invalid color: {s}"));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| format!("invalid color: {s}"))
        };
        Ok(Self { r: channel(0)?, g: channel(2)?, b: channel(4)? })
    }
}

impl Serialize for CursorColor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CursorColor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Identity resolution
// ───────────────────────────────────────────────────────────────────

/// A known user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub color: CursorColor,
}

impl UserProfile {
    /// Profile with a color derived from the id.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        let color = CursorColor::from_user_id(&id);
        Self { id, name: name.into(), color }
    }

    pub fn with_color(mut self, color: CursorColor) -> Self {
        self.color = color;
        self
    }
}

/// Resolves roster user ids into profiles.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, user_id: &str) -> Option<UserProfile>;
}

/// In-memory user directory.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    profiles: HashMap<String, UserProfile>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a profile.
    pub fn insert(&mut self, profile: UserProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, profile: UserProfile) -> Self {
        self.insert(profile);
        self
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl IdentityResolver for Directory {
    fn resolve(&self, user_id: &str) -> Option<UserProfile> {
        self.profiles.get(user_id).cloned()
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// An active, resolved participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,
    pub profile: UserProfile,
    pub cursor: Position,
    pub selection: Selection,
}

/// A remote cursor as published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCursor {
    pub position: Position,
    pub color: CursorColor,
}

/// A remote selection as published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSelection {
    pub selection: Selection,
    pub color: CursorColor,
}

/// Presence updates produced by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    CursorMoved { user_id: String, cursor: RemoteCursor },
    SelectionMoved { user_id: String, selection: RemoteSelection },
    CursorRemoved { user_id: String },
    SelectionRemoved { user_id: String },
}

/// Membership difference between two rosters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDelta {
    /// Newly present participants.
    pub added: Vec<String>,
    /// Previously tracked participants no longer present.
    pub removed: Vec<String>,
    /// Participants present before and after.
    pub refreshed: Vec<String>,
    /// Roster entries dropped because their identity did not resolve.
    pub unresolved: Vec<String>,
}

impl RosterDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.refreshed.is_empty()
    }
}

/// Result of applying a roster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterUpdate {
    pub delta: RosterDelta,
    pub changes: Vec<PresenceChange>,
}

/// Tracks active participants and their cursors/selections.
///
/// Never holds presence for a user absent from the latest roster, and
/// never tracks presence for the local user.
pub struct ParticipantRegistry {
    local_user_id: String,
    resolver: Arc<dyn IdentityResolver>,
    default_color: CursorColor,
    /// Resolved participants, in roster order.
    participants: Vec<Participant>,
    cursors: HashMap<String, RemoteCursor>,
    selections: HashMap<String, RemoteSelection>,
}

impl ParticipantRegistry {
    pub fn new(local_user_id: impl Into<String>, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            resolver,
            default_color: CursorColor::FALLBACK,
            participants: Vec::new(),
            cursors: HashMap::new(),
            selections: HashMap::new(),
        }
    }

    /// Override the color used for unknown participants.
    pub fn with_default_color(mut self, color: CursorColor) -> Self {
        self.default_color = color;
        self
    }

    /// Replace the roster.
    ///
    /// Entries whose identity cannot be resolved are logged and dropped.
    /// Presence of users no longer present is removed; every remaining
    /// participant's cursor and selection is republished.
    pub fn set_roster(&mut self, entries: &[RosterEntry]) -> RosterUpdate {
        let previous: HashSet<String> =
            self.participants.iter().map(|p| p.user_id.clone()).collect();
        let mut delta = RosterDelta::default();

        let mut participants = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(profile) = self.resolver.resolve(&entry.user_id) else {
                log::error!("participant non user: {}", entry.user_id);
                delta.unresolved.push(entry.user_id.clone());
                continue;
            };
            if participants.iter().any(|p: &Participant| p.user_id == entry.user_id) {
                continue;
            }
            participants.push(Participant {
                user_id: entry.user_id.clone(),
                profile,
                cursor: entry.cursor,
                selection: entry.selection,
            });
        }

        let current: HashSet<&str> = participants.iter().map(|p| p.user_id.as_str()).collect();
        for p in &participants {
            if previous.contains(&p.user_id) {
                delta.refreshed.push(p.user_id.clone());
            } else {
                delta.added.push(p.user_id.clone());
            }
        }
        for p in &self.participants {
            if !current.contains(p.user_id.as_str()) {
                delta.removed.push(p.user_id.clone());
            }
        }
        log::debug!("update participants {:?}", current);

        let mut changes = Vec::new();

        let mut stale: Vec<String> = self
            .cursors
            .keys()
            .filter(|id| !current.contains(id.as_str()))
            .cloned()
            .collect();
        stale.sort();
        for user_id in stale {
            self.cursors.remove(&user_id);
            changes.push(PresenceChange::CursorRemoved { user_id });
        }
        let mut stale: Vec<String> = self
            .selections
            .keys()
            .filter(|id| !current.contains(id.as_str()))
            .cloned()
            .collect();
        stale.sort();
        for user_id in stale {
            self.selections.remove(&user_id);
            changes.push(PresenceChange::SelectionRemoved { user_id });
        }

        self.participants = participants;

        let republish: Vec<(String, Position, Selection)> = self
            .participants
            .iter()
            .map(|p| (p.user_id.clone(), p.cursor, p.selection))
            .collect();
        for (user_id, cursor, selection) in republish {
            changes.extend(self.move_cursor(&user_id, cursor));
            changes.extend(self.move_selection(&user_id, selection));
        }

        RosterUpdate { delta, changes }
    }

    /// Record a remote cursor move.
    ///
    /// Ignored for the local user and for users not in the roster.
    pub fn move_cursor(&mut self, user_id: &str, position: Position) -> Option<PresenceChange> {
        let color = self.tracked_color(user_id)?;
        let cursor = RemoteCursor { position, color };
        if let Some(p) = self.participants.iter_mut().find(|p| p.user_id == user_id) {
            p.cursor = position;
        }
        self.cursors.insert(user_id.to_string(), cursor);
        Some(PresenceChange::CursorMoved { user_id: user_id.to_string(), cursor })
    }

    /// Record a remote selection change.
    ///
    /// Ignored for the local user and for users not in the roster.
    pub fn move_selection(&mut self, user_id: &str, selection: Selection) -> Option<PresenceChange> {
        let color = self.tracked_color(user_id)?;
        let remote = RemoteSelection { selection, color };
        if let Some(p) = self.participants.iter_mut().find(|p| p.user_id == user_id) {
            p.selection = selection;
        }
        self.selections.insert(user_id.to_string(), remote);
        Some(PresenceChange::SelectionMoved { user_id: user_id.to_string(), selection: remote })
    }

    fn tracked_color(&self, user_id: &str) -> Option<CursorColor> {
        if user_id == self.local_user_id {
            return None;
        }
        if !self.contains(user_id) {
            log::debug!("presence from {user_id} outside the roster, ignoring");
            return None;
        }
        Some(self.color_for(user_id))
    }

    /// Color of a participant, or the default color if unknown.
    pub fn color_for(&self, user_id: &str) -> CursorColor {
        self.participants
            .iter()
            .find(|p| p.user_id == user_id)
            .map_or(self.default_color, |p| p.profile.color)
    }

    /// Whether `user_id` is in the current roster.
    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn cursor(&self, user_id: &str) -> Option<&RemoteCursor> {
        self.cursors.get(user_id)
    }

    pub fn selection(&self, user_id: &str) -> Option<&RemoteSelection> {
        self.selections.get(user_id)
    }

    /// All tracked remote cursors.
    pub fn cursors(&self) -> &HashMap<String, RemoteCursor> {
        &self.cursors
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(ids: &[&str]) -> Arc<dyn IdentityResolver> {
        let mut dir = Directory::new();
        for id in ids {
            dir.insert(UserProfile::new(*id, id.to_uppercase()));
        }
        Arc::new(dir)
    }

    fn entry(id: &str, x: usize, y: usize) -> RosterEntry {
        RosterEntry {
            user_id: id.to_string(),
            cursor: Position::new(x, y),
            selection: Selection::new(Position::new(x, y), Position::new(x + 1, y)),
        }
    }

    #[test]
    fn test_color_from_user_id_stable() {
        assert_eq!(CursorColor::from_user_id("alice"), CursorColor::from_user_id("alice"));
    }

    #[test]
    fn test_color_hex_roundtrip() {
        let color = CursorColor::rgb(0x12, 0xab, 0xff);
        assert_eq!(color.to_string(), "#12abff");
        assert_eq!("#12abff".parse::<CursorColor>().unwrap(), color);
        assert!("#12ab".parse::<CursorColor>().is_err());
        assert!("#zzzzzz".parse::<CursorColor>().is_err());
    }

    #[test]
    fn test_color_serde_as_string() {
        let json = serde_json::to_string(&CursorColor::FALLBACK).unwrap();
        assert_eq!(json, "\"#ff0000\"");
        let back: CursorColor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CursorColor::FALLBACK);
    }

    #[test]
    fn test_hsl_to_rgb_achromatic() {
        assert_eq!(hsl_to_rgb(0.3, 0.0, 0.5), (0.5, 0.5, 0.5));
    }

    #[test]
    fn test_roster_delta_add_remove_refresh() {
        let mut reg = ParticipantRegistry::new("me", directory(&["a", "b", "c"]));
        reg.set_roster(&[entry("a", 1, 0), entry("b", 2, 0)]);
        assert!(reg.cursor("a").is_some());

        let update = reg.set_roster(&[entry("b", 3, 1), entry("c", 0, 2)]);
        assert_eq!(update.delta.removed, vec!["a".to_string()]);
        assert_eq!(update.delta.added, vec!["c".to_string()]);
        assert_eq!(update.delta.refreshed, vec!["b".to_string()]);

        assert!(update.changes.contains(&PresenceChange::CursorRemoved { user_id: "a".into() }));
        assert!(update.changes.contains(&PresenceChange::SelectionRemoved { user_id: "a".into() }));
        assert!(reg.cursor("a").is_none());
        assert!(reg.selection("a").is_none());

        // b is republished with its new cursor
        assert_eq!(reg.cursor("b").unwrap().position, Position::new(3, 1));
        assert!(update.changes.iter().any(|c| matches!(
            c,
            PresenceChange::CursorMoved { user_id, .. } if user_id == "b"
        )));
    }

    #[test]
    fn test_unresolved_identity_dropped() {
        let mut reg = ParticipantRegistry::new("me", directory(&["a"]));
        let update = reg.set_roster(&[entry("a", 0, 0), entry("ghost", 0, 0)]);
        assert_eq!(update.delta.unresolved, vec!["ghost".to_string()]);
        assert_eq!(reg.len(), 1);
        assert!(!reg.contains("ghost"));
        assert!(reg.move_cursor("ghost", Position::new(1, 1)).is_none());
    }

    #[test]
    fn test_local_user_has_no_presence() {
        let mut reg = ParticipantRegistry::new("me", directory(&["me", "a"]));
        let update = reg.set_roster(&[entry("me", 4, 4), entry("a", 0, 0)]);
        assert!(reg.contains("me"));
        assert!(reg.cursor("me").is_none());
        assert!(update.changes.iter().all(|c| !matches!(
            c,
            PresenceChange::CursorMoved { user_id, .. } if user_id == "me"
        )));
        assert!(reg.move_cursor("me", Position::new(1, 1)).is_none());
    }

    #[test]
    fn test_move_cursor_outside_roster_ignored() {
        let mut reg = ParticipantRegistry::new("me", directory(&["a", "z"]));
        reg.set_roster(&[entry("a", 0, 0)]);
        assert!(reg.move_cursor("z", Position::new(1, 1)).is_none());
        assert!(reg.cursor("z").is_none());

        let change = reg.move_cursor("a", Position::new(5, 2)).unwrap();
        match change {
            PresenceChange::CursorMoved { user_id, cursor } => {
                assert_eq!(user_id, "a");
                assert_eq!(cursor.position, Position::new(5, 2));
                assert_eq!(cursor.color, CursorColor::from_user_id("a"));
            }
            other => panic!("unexpected change {other:?}"),
        }
        assert_eq!(reg.participants()[0].cursor, Position::new(5, 2));
    }

    #[test]
    fn test_color_for_known_and_unknown() {
        let dir = Directory::new()
            .with(UserProfile::new("a", "A").with_color(CursorColor::rgb(1, 2, 3)));
        let mut reg = ParticipantRegistry::new("me", Arc::new(dir));
        reg.set_roster(&[entry("a", 0, 0)]);
        assert_eq!(reg.color_for("a"), CursorColor::rgb(1, 2, 3));
        assert_eq!(reg.color_for("nobody"), CursorColor::FALLBACK);

        let reg = reg.with_default_color(CursorColor::rgb(9, 9, 9));
        assert_eq!(reg.color_for("nobody"), CursorColor::rgb(9, 9, 9));
    }

    #[test]
    fn test_empty_roster_clears_everything() {
        let mut reg = ParticipantRegistry::new("me", directory(&["a", "b"]));
        reg.set_roster(&[entry("a", 0, 0), entry("b", 0, 0)]);
        let update = reg.set_roster(&[]);
        assert_eq!(update.delta.removed.len(), 2);
        assert!(reg.is_empty());
        assert!(reg.cursors().is_empty());
    }
}
