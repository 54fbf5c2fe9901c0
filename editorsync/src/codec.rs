//! Patch generation, application and hashing.
//!
//! A patch is a character-level diff between two full contents, grouped
//! into hunks with a few characters of surrounding context:
//!
//! ```text
//! @@ -0,6 +0,7 @@        ← start/length in the old and new content
//!  a                     ← equal (context)
//! +X                     ← insert
//!  bc%0Ad                ← equal, percent-encoded
//! ```
//!
//! Application locates each hunk's old text (context + removals) at its
//! expected offset, or at the nearest exact occurrence within
//! [`MATCH_DISTANCE`] characters. A hunk that cannot be located fails the
//! whole patch; callers fall back to a full resync instead of keeping a
//! partial result.

use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};

use crate::error::CodecError;

/// Characters of context kept on each side of a change.
pub const PATCH_MARGIN: usize = 4;

/// How far (in chars) from its expected offset a hunk may be found.
pub const MATCH_DISTANCE: usize = 1000;

/// Content hash used for change detection: CRC-32 as 8 hex digits.
pub fn hash(content: &str) -> String {
    format!("{:08x}", crc32fast::hash(content.as_bytes()))
}

/// A serialized diff plus the hashes of the content it goes from and to.
///
/// Immutable once built; a patch is only ever resent verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub diff_text: String,
    pub hash_before: String,
    pub hash_after: String,
}

impl Patch {
    /// Parse the diff text into hunks.
    pub fn hunks(&self) -> Result<Vec<Hunk>, CodecError> {
        parse_hunks(&self.diff_text)
    }

    /// Expand the diff into ordered insert/remove operations.
    pub fn to_operations(&self) -> Result<Vec<Operation>, CodecError> {
        Ok(operations(&self.hunks()?))
    }

    /// Whether the diff carries no change at all.
    pub fn is_empty(&self) -> bool {
        self.diff_text.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Equal,
    Insert,
    Remove,
}

impl SegmentKind {
    fn prefix(self) -> char {
        match self {
            Self::Equal => ' ',
            Self::Insert => '+',
            Self::Remove => '-',
        }
    }

    fn from_prefix(c: char) -> Option<Self> {
        match c {
            ' ' => Some(Self::Equal),
            '+' => Some(Self::Insert),
            '-' => Some(Self::Remove),
            _ => None,
        }
    }
}

/// A run of text sharing one diff tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub text: String,
}

/// One contiguous change region with its context.
///
/// `start1`/`length1` address the old content, `start2`/`length2` the new
/// content; all values are char counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub start1: usize,
    pub length1: usize,
    pub start2: usize,
    pub length2: usize,
    pub segments: Vec<Segment>,
}

impl Hunk {
    /// Text this hunk expects to find (context and removals).
    fn old_text(&self) -> Vec<char> {
        self.collect(SegmentKind::Insert)
    }

    /// Text this hunk leaves behind (context and inserts).
    fn new_text(&self) -> Vec<char> {
        self.collect(SegmentKind::Remove)
    }

    fn collect(&self, skip: SegmentKind) -> Vec<char> {
        self.segments
            .iter()
            .filter(|s| s.kind != skip)
            .flat_map(|s| s.text.chars())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Remove,
}

/// A single edit with an absolute offset in pre-operation coordinates:
/// each operation's index refers to the content as left by the previous
/// operation in the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub content: String,
    pub index: usize,
}

impl Operation {
    pub fn insert(content: impl Into<String>, index: usize) -> Self {
        Self { kind: OperationKind::Insert, content: content.into(), index }
    }

    pub fn remove(content: impl Into<String>, index: usize) -> Self {
        Self { kind: OperationKind::Remove, content: content.into(), index }
    }

    /// Length of the operation content in chars.
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// Diff `before` → `after` into a [`Patch`].
pub fn diff(before: &str, after: &str) -> Patch {
    Patch {
        diff_text: hunks_to_text(&make_hunks(before, after)),
        hash_before: hash(before),
        hash_after: hash(after),
    }
}

/// Compute the hunks turning `before` into `after`.
pub fn make_hunks(before: &str, after: &str) -> Vec<Hunk> {
    if before == after {
        return Vec::new();
    }

    let diff = TextDiff::from_chars(before, after);
    let mut hunks = Vec::new();

    for group in diff.grouped_ops(PATCH_MARGIN) {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let old = first.old_range().start..last.old_range().end;
        let new = first.new_range().start..last.new_range().end;

        let mut segments: Vec<Segment> = Vec::new();
        for op in &group {
            for change in diff.iter_changes(op) {
                let kind = match change.tag() {
                    ChangeTag::Equal => SegmentKind::Equal,
                    ChangeTag::Insert => SegmentKind::Insert,
                    ChangeTag::Delete => SegmentKind::Remove,
                };
                match segments.last_mut() {
                    Some(seg) if seg.kind == kind => seg.text.push_str(change.value()),
                    _ => segments.push(Segment { kind, text: change.value().to_string() }),
                }
            }
        }

        hunks.push(Hunk {
            start1: old.start,
            length1: old.len(),
            start2: new.start,
            length2: new.len(),
            segments,
        });
    }

    hunks
}

/// Serialize hunks into patch text.
pub fn hunks_to_text(hunks: &[Hunk]) -> String {
    let mut out = String::new();
    for hunk in hunks {
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            hunk.start1, hunk.length1, hunk.start2, hunk.length2
        ));
        for seg in &hunk.segments {
            out.push(seg.kind.prefix());
            out.push_str(&urlencoding::encode(&seg.text));
            out.push('\n');
        }
    }
    out
}

/// Parse patch text back into hunks.
pub fn parse_hunks(text: &str) -> Result<Vec<Hunk>, CodecError> {
    let mut hunks: Vec<Hunk> = Vec::new();

    for line in text.split('\n').filter(|l| !l.is_empty()) {
        if let Some(header) = line.strip_prefix("@@ -") {
            hunks.push(parse_header(header, line)?);
            continue;
        }

        let mut chars = line.chars();
        let kind = chars
            .next()
            .and_then(SegmentKind::from_prefix)
            .ok_or_else(|| CodecError::MalformedHunk(line.to_string()))?;
        let hunk = hunks
            .last_mut()
            .ok_or_else(|| CodecError::MalformedHunk(line.to_string()))?;
        let decoded = urlencoding::decode(chars.as_str())
            .map_err(|e| CodecError::InvalidEscape(e.to_string()))?;
        hunk.segments.push(Segment { kind, text: decoded.into_owned() });
    }

    Ok(hunks)
}

fn parse_header(header: &str, line: &str) -> Result<Hunk, CodecError> {
    let malformed = || CodecError::MalformedHunk(line.to_string());

    let body = header.strip_suffix(" @@").ok_or_else(malformed)?;
    let (old, new) = body.split_once(" +").ok_or_else(malformed)?;
    let range = |s: &str| -> Result<(usize, usize), CodecError> {
        let (start, len) = s.split_once(',').ok_or_else(malformed)?;
        Ok((
            start.parse().map_err(|_| malformed())?,
            len.parse().map_err(|_| malformed())?,
        ))
    };
    let (start1, length1) = range(old)?;
    let (start2, length2) = range(new)?;

    Ok(Hunk { start1, length1, start2, length2, segments: Vec::new() })
}

/// Apply `patch` to `baseline`.
///
/// Returns the new content and `true` when every hunk applied cleanly.
/// On any failure the baseline is returned unchanged with `false`.
pub fn apply(patch: &Patch, baseline: &str) -> (String, bool) {
    let hunks = match patch.hunks() {
        Ok(h) => h,
        Err(e) => {
            log::error!("Cannot parse patch: {e}");
            return (baseline.to_string(), false);
        }
    };

    let (content, results) = apply_hunks(&hunks, baseline);
    if results.iter().all(|ok| *ok) {
        (content, true)
    } else {
        (baseline.to_string(), false)
    }
}

/// Apply hunks in order, reporting per-hunk success.
///
/// Hunks that cannot be located are skipped; the returned content then
/// only reflects the hunks that did apply.
pub fn apply_hunks(hunks: &[Hunk], baseline: &str) -> (String, Vec<bool>) {
    let mut text: Vec<char> = baseline.chars().collect();
    let mut results = Vec::with_capacity(hunks.len());
    // Offset between where hunks were expected and where they were found.
    let mut drift: isize = 0;

    for hunk in hunks {
        let expected = hunk.old_text();
        let guess = (hunk.start2 as isize + drift).max(0) as usize;

        match find_near(&text, &expected, guess) {
            Some(found) => {
                drift = found as isize - hunk.start2 as isize;
                text.splice(found..found + expected.len(), hunk.new_text());
                results.push(true);
            }
            None => results.push(false),
        }
    }

    (text.into_iter().collect(), results)
}

/// Find `pattern` in `text` at `loc`, or at the closest exact match
/// within [`MATCH_DISTANCE`].
fn find_near(text: &[char], pattern: &[char], loc: usize) -> Option<usize> {
    if pattern.len() > text.len() {
        return None;
    }
    let last_start = text.len() - pattern.len();
    let loc = loc.min(last_start);
    let matches_at = |i: usize| text[i..i + pattern.len()] == *pattern;

    if matches_at(loc) {
        return Some(loc);
    }
    for distance in 1..=MATCH_DISTANCE {
        let before = loc.checked_sub(distance);
        let after = (loc + distance <= last_start).then_some(loc + distance);
        if before.is_none() && after.is_none() {
            break;
        }
        if let Some(i) = before.filter(|i| matches_at(*i)) {
            return Some(i);
        }
        if let Some(i) = after.filter(|i| matches_at(*i)) {
            return Some(i);
        }
    }
    None
}

/// Flatten hunks into operations.
///
/// Each hunk starts at its offset in the new content; equal segments and
/// inserts advance the offset, removals leave it in place.
pub fn operations(hunks: &[Hunk]) -> Vec<Operation> {
    let mut ops = Vec::new();
    for hunk in hunks {
        let mut index = hunk.start2;
        for seg in &hunk.segments {
            let len = seg.text.chars().count();
            match seg.kind {
                SegmentKind::Equal => index += len,
                SegmentKind::Insert => {
                    ops.push(Operation::insert(seg.text.clone(), index));
                    index += len;
                }
                SegmentKind::Remove => ops.push(Operation::remove(seg.text.clone(), index)),
            }
        }
    }
    ops
}
