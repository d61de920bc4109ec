//! Minimal text diff for collaborative text.
//!
//! Converts a "replace the whole string" intent into a single positional
//! replacement: strip the longest common suffix, then the longest common
//! prefix that still fits in front of it, and replace only the middle.
//!
//! ```text
//! old:  Hello│      │ World
//! new:  Hello│ Orbit│ World
//!       prefix middle suffix
//! ```
//!
//! A single keystroke therefore costs one insert or one delete, and every
//! untouched character keeps its replicated identity (remote cursors stay
//! anchored).
//!
//! Positions and lengths are counted in Unicode scalar values (`char`s).

use std::ops::Range;

/// One contiguous replacement: remove `remove` chars at `index`, then
/// insert `insert` at the same position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    /// Char index where the replaced region starts.
    pub index: usize,
    /// Number of chars to delete at `index`.
    pub remove: usize,
    /// Text inserted at `index` after the deletion.
    pub insert: String,
}

impl TextEdit {
    /// Byte range in `old` covered by the deletion.
    pub fn byte_range(&self, old: &str) -> Range<usize> {
        let start = byte_offset(old, self.index);
        let end = byte_offset(old, self.index + self.remove);
        start..end
    }

    /// Apply this edit to `old`, producing the new string.
    pub fn apply(&self, old: &str) -> String {
        let range = self.byte_range(old);
        let mut out = String::with_capacity(old.len() - range.len() + self.insert.len());
        out.push_str(&old[..range.start]);
        out.push_str(&self.insert);
        out.push_str(&old[range.end..]);
        out
    }

    /// Whether the edit deletes anything.
    pub fn has_delete(&self) -> bool {
        self.remove > 0
    }

    /// Whether the edit inserts anything.
    pub fn has_insert(&self) -> bool {
        !self.insert.is_empty()
    }
}

/// Compute the minimal single-region edit turning `old` into `new`.
///
/// Returns `None` when the strings are identical.
pub fn diff(old: &str, new: &str) -> Option<TextEdit> {
    if old == new {
        return None;
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();
    let shortest = old_chars.len().min(new_chars.len());

    let suffix = old_chars
        .iter()
        .rev()
        .zip(new_chars.iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    // Prefix may not overlap the suffix in either string.
    let prefix = old_chars
        .iter()
        .zip(new_chars.iter())
        .take(shortest - suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let remove = old_chars.len() - prefix - suffix;
    let insert: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

    Some(TextEdit {
        index: prefix,
        remove,
        insert,
    })
}

/// Byte offset of the `index`-th char, clamped to the end of the string.
fn byte_offset(s: &str, index: usize) -> usize {
    s.char_indices().nth(index).map_or(s.len(), |(offset, _)| offset)
}
