//! Offset ↔ (column, row) mapping and cursor shifting across operations.
//!
//! Offsets count Unicode scalar values (`char`s), never bytes. Both
//! conversions are a linear scan over the content. Callers that map many
//! positions against the same revision may cache line starts themselves;
//! the observable results must stay identical to the scan below.

use serde::{Deserialize, Serialize};

use crate::codec::{Operation, OperationKind};

/// A (column, row) coordinate. `x` is the column, `y` the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: usize,
    pub y: usize,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0, y: 0 };

    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }
}

/// A selection range between two positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Selection {
    pub start: Position,
    pub end: Position,
}

impl Selection {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Whether the selection is empty (start == end).
    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }
}

/// Convert an absolute offset into a position.
///
/// Negative offsets map to the origin. Offsets past the end of `content`
/// clamp to the position reached at the end of the scan.
pub fn offset_to_position(content: &str, offset: i64) -> Position {
    let mut pos = Position::ORIGIN;
    if offset < 0 {
        return pos;
    }

    for (i, c) in content.chars().enumerate() {
        if i as i64 == offset {
            break;
        }
        pos.x += 1;
        if c == '\n' {
            pos.x = 0;
            pos.y += 1;
        }
    }
    pos
}

/// Convert a position back into an absolute offset.
///
/// If the position is not reached before the end of `content`, the last
/// index visited by the scan is returned.
pub fn position_to_offset(content: &str, position: Position) -> i64 {
    let (mut x, mut y) = (0usize, 0usize);
    let mut index = 0i64;

    for (i, c) in content.chars().enumerate() {
        index = i as i64;
        if position.x == x && position.y == y {
            break;
        }
        x += 1;
        if c == '\n' {
            x = 0;
            y += 1;
        }
    }
    index
}

/// Shift `offset` across `operations`, applied in order.
///
/// An operation at or before the offset moves it by the length of its
/// content (forward for inserts, backward for removals); operations
/// strictly after the offset leave it untouched.
pub fn shift_offset(offset: i64, operations: &[Operation]) -> i64 {
    operations.iter().fold(offset, |offset, op| {
        if offset < op.index as i64 {
            return offset;
        }
        let len = op.char_len() as i64;
        match op.kind {
            OperationKind::Insert => offset + len,
            OperationKind::Remove => offset - len,
        }
    })
}

/// Carry a position in `previous` content over to `content` after
/// `operations` transformed one into the other.
pub fn remap_position(
    previous: &str,
    content: &str,
    position: Position,
    operations: &[Operation],
) -> Position {
    let offset = position_to_offset(previous, position);
    offset_to_position(content, shift_offset(offset, operations))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(content: &str, index: usize) -> Operation {
        Operation::insert(content, index)
    }

    #[test]
    fn test_offset_to_position_second_line() {
        assert_eq!(offset_to_position("ab\ncd", 3), Position::new(0, 1));
        assert_eq!(offset_to_position("ab\ncd", 4), Position::new(1, 1));
    }

    #[test]
    fn test_offset_to_position_negative_is_origin() {
        assert_eq!(offset_to_position("ab\ncd", -5), Position::ORIGIN);
    }

    #[test]
    fn test_offset_to_position_clamps_past_end() {
        assert_eq!(offset_to_position("ab\ncd", 100), Position::new(2, 1));
        assert_eq!(offset_to_position("", 3), Position::ORIGIN);
    }

    #[test]
    fn test_position_to_offset_second_line() {
        assert_eq!(position_to_offset("ab\ncd", Position::new(0, 1)), 3);
        assert_eq!(position_to_offset("ab\ncd", Position::new(1, 0)), 1);
    }

    #[test]
    fn test_position_to_offset_unreached_returns_last_index() {
        assert_eq!(position_to_offset("ab\ncd", Position::new(9, 9)), 4);
        assert_eq!(position_to_offset("", Position::new(3, 0)), 0);
    }

    #[test]
    fn test_offsets_count_chars_not_bytes() {
        let content = "é\nü";
        assert_eq!(offset_to_position(content, 2), Position::new(0, 1));
        assert_eq!(position_to_offset(content, Position::new(0, 1)), 2);
    }

    #[test]
    fn test_shift_offset_insert_before_and_after() {
        let ops = vec![insert("X", 1)];
        assert_eq!(shift_offset(3, &ops), 4);
        assert_eq!(shift_offset(1, &ops), 2);
        assert_eq!(shift_offset(0, &ops), 0);
    }

    #[test]
    fn test_shift_offset_remove() {
        let ops = vec![Operation::remove("bc", 1)];
        assert_eq!(shift_offset(5, &ops), 3);
        assert_eq!(shift_offset(0, &ops), 0);
    }

    #[test]
    fn test_shift_offset_applies_in_order() {
        let ops = vec![insert("XY", 0), Operation::remove("Z", 4)];
        // 3 -> 5 after the insert, then the removal at 4 applies.
        assert_eq!(shift_offset(3, &ops), 4);
    }

    #[test]
    fn test_remap_position_across_lines() {
        let previous = "abc\ndef";
        let content = "abc\nXXdef";
        let ops = vec![insert("XX", 4)];
        let moved = remap_position(previous, content, Position::new(1, 1), &ops);
        assert_eq!(moved, Position::new(3, 1));
    }

    #[test]
    fn test_selection_collapsed() {
        let p = Position::new(2, 3);
        assert!(Selection::new(p, p).is_collapsed());
        assert!(!Selection::new(Position::ORIGIN, p).is_collapsed());
    }
}
