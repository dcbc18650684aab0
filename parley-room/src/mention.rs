//! Mention and unread classification over reconciled entries.
//!
//! Everything here is a pure read over the log; nothing mutates it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::room::ChatEntry;

/// Unread counters for one reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSummary {
    /// Confirmed entries by other users after the last read entry.
    pub unread: usize,
    /// How many of those mention the reader.
    pub mentions: usize,
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

/// Whether `content` mentions `name` as `@name`.
///
/// Matching is case-insensitive and the mention must not run into further
/// name characters (`@al` does not match inside `@alice`). Non-text
/// content never mentions anyone.
pub fn mentions(content: &Value, name: &str) -> bool {
    let text = match content.as_str() {
        Some(text) => text,
        None => return false,
    };
    if name.is_empty() {
        return false;
    }

    let haystack = text.to_lowercase();
    let needle = format!("@{}", name.to_lowercase());

    let mut from = 0;
    while let Some(found) = haystack[from..].find(&needle) {
        let end = from + found + needle.len();
        match haystack[end..].chars().next() {
            Some(c) if is_name_char(c) => {}
            _ => return true,
        }
        from = from + found + 1;
    }
    false
}

/// Count unread entries and mentions for `reader`.
///
/// Entries after `last_read_id` are unread; when it is `None` or no longer
/// in the log, every entry is. Pending entries and the reader's own
/// messages are not counted.
pub fn unread_summary(entries: &[ChatEntry], last_read_id: Option<&str>, reader: &str) -> UnreadSummary {
    let start = last_read_id
        .and_then(|id| entries.iter().rposition(|e| e.id == id))
        .map_or(0, |idx| idx + 1);

    entries[start..]
        .iter()
        .filter(|e| !e.pending && e.user != reader)
        .fold(UnreadSummary::default(), |mut acc, e| {
            acc.unread += 1;
            if mentions(&e.content, reader) {
                acc.mentions += 1;
            }
            acc
        })
}
