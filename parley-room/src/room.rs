//! Per-room state: the message log and the snapshot handed to renderers
//! and persistence.
//!
//! Optimistic local entries and confirmed entries live in the same log,
//! distinguished by [`ChatEntry::pending`], because echo matching has to
//! scan both kinds in one pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::protocol::{ChatMessage, Envelope, MessageUpdate, Participant, Role};

/// One entry of a room's message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: String,
    pub content: Value,
    pub user: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Written locally, not yet matched to a relay echo.
    #[serde(default)]
    pub pending: bool,
}

impl ChatEntry {
    /// Create a pending entry for a message this client is about to send.
    pub fn local(content: Value, user: impl Into<String>, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content,
            user: user.into(),
            role,
            created_at: Some(now),
            pending: true,
        }
    }

    /// Create a confirmed entry from a relayed message.
    pub fn confirmed(message: ChatMessage) -> Self {
        Self {
            id: message.id,
            content: message.content,
            user: message.user,
            role: message.role,
            created_at: message.created_at,
            pending: false,
        }
    }

    /// Wire form of this entry.
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage {
            id: self.id.clone(),
            content: self.content.clone(),
            user: self.user.clone(),
            role: self.role,
            created_at: self.created_at,
        }
    }

    /// The `add` envelope announcing this entry.
    pub fn to_add_envelope(&self) -> Envelope {
        Envelope::add(self.to_message())
    }

    /// Whether a relayed message carries exactly what this entry holds.
    pub fn matches(&self, message: &ChatMessage) -> bool {
        self.id == message.id
            && self.user == message.user
            && self.role == message.role
            && self.content == message.content
            && (message.created_at.is_none() || message.created_at == self.created_at)
    }

    /// Take every field from the relayed message and mark the entry confirmed.
    ///
    /// A missing `created_at` keeps the local timestamp.
    pub(crate) fn absorb(&mut self, message: ChatMessage) {
        self.id = message.id;
        self.content = message.content;
        self.user = message.user;
        self.role = message.role;
        if message.created_at.is_some() {
            self.created_at = message.created_at;
        }
        self.pending = false;
    }

    /// Overwrite the mutable fields from an `update` body. Returns `true`
    /// if anything changed.
    pub(crate) fn overwrite(&mut self, update: &MessageUpdate) -> bool {
        let changed = self.pending
            || self.content != update.content
            || self.user != update.user
            || self.role != update.role;
        self.content = update.content.clone();
        self.user = update.user.clone();
        self.role = update.role;
        self.pending = false;
        changed
    }
}

/// Ordered message log with the one-entry-per-id invariant.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Vec<ChatEntry>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a log from persisted entries. Later duplicates of an id win.
    pub fn from_entries(entries: Vec<ChatEntry>) -> Self {
        let mut log = Self::new();
        for entry in entries {
            match log.position(&entry.id) {
                Some(idx) => log.entries[idx] = entry,
                None => log.entries.push(entry),
            }
        }
        log
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ChatEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.pending).count()
    }

    pub(crate) fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().rposition(|e| e.id == id)
    }

    pub(crate) fn entry_mut(&mut self, idx: usize) -> &mut ChatEntry {
        &mut self.entries[idx]
    }

    /// Append an entry whose id is not yet in the log.
    pub(crate) fn push(&mut self, entry: ChatEntry) {
        debug_assert!(self.position(&entry.id).is_none());
        self.entries.push(entry);
    }

    /// Find the pending entry a relayed message is most likely the echo of.
    ///
    /// Only the newest `depth` entries are scanned. Among them, the oldest
    /// pending entry by the same user with equal content, created no more
    /// than `window` before `now`, wins.
    pub(crate) fn find_echo_candidate(
        &self,
        user: &str,
        content: &Value,
        now: DateTime<Utc>,
        window: Duration,
        depth: usize,
    ) -> Option<usize> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let start = self.entries.len().saturating_sub(depth);

        self.entries[start..]
            .iter()
            .position(|e| {
                e.pending
                    && e.user == user
                    && &e.content == content
                    && e
                        .created_at
                        .map_or(false, |created| now.signed_duration_since(created) <= window)
            })
            .map(|offset| start + offset)
    }

    /// Drop the oldest confirmed entries until at most `cap` remain.
    ///
    /// Pending entries and the newest entry are never dropped, so the log
    /// may stay above `cap` while many sends are unconfirmed. Returns the
    /// number of dropped entries.
    pub fn trim(&mut self, cap: usize) -> usize {
        let mut excess = self.entries.len().saturating_sub(cap);
        if excess == 0 {
            return 0;
        }

        let before = self.entries.len();
        let newest = before - 1;
        let mut idx = 0;
        self.entries.retain(|e| {
            let keep = e.pending || idx == newest || excess == 0;
            if !keep {
                excess -= 1;
            }
            idx += 1;
            keep
        });
        before - self.entries.len()
    }
}

/// Point-in-time copy of one room's state.
///
/// This is the unit written to persistence and handed to renderers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub messages: Vec<ChatEntry>,
    pub participants: Vec<Participant>,
}

impl RoomSnapshot {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.participants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn confirmed(id: &str, text: &str) -> ChatEntry {
        ChatEntry::confirmed(ChatMessage {
            id: id.into(),
            content: json!(text),
            user: "Bob".into(),
            role: Role::User,
            created_at: Some(t0()),
        })
    }

    #[test]
    fn test_local_entry_is_pending() {
        let entry = ChatEntry::local(json!("hi"), "Alice", Role::User, t0());
        assert!(entry.pending);
        assert_eq!(entry.created_at, Some(t0()));
        assert!(Uuid::parse_str(&entry.id).is_ok());

        let other = ChatEntry::local(json!("hi"), "Alice", Role::User, t0());
        assert_ne!(entry.id, other.id);
    }

    #[test]
    fn test_absorb_takes_relay_fields() {
        let mut entry = ChatEntry::local(json!("hi"), "Alice", Role::User, t0());
        entry.absorb(ChatMessage {
            id: "server-id".into(),
            content: json!("hi"),
            user: "Alice".into(),
            role: Role::User,
            created_at: None,
        });
        assert_eq!(entry.id, "server-id");
        assert!(!entry.pending);
        // Missing relay timestamp keeps the local one.
        assert_eq!(entry.created_at, Some(t0()));
    }

    #[test]
    fn test_overwrite_reports_change() {
        let mut entry = confirmed("a", "one");
        let same = MessageUpdate {
            id: "a".into(),
            content: json!("one"),
            user: "Bob".into(),
            role: Role::User,
        };
        assert!(!entry.overwrite(&same));

        let edited = MessageUpdate {
            content: json!("two"),
            ..same
        };
        assert!(entry.overwrite(&edited));
        assert_eq!(entry.content, json!("two"));
        assert_eq!(entry.created_at, Some(t0()));
    }

    #[test]
    fn test_from_entries_dedupes_ids() {
        let log = MessageLog::from_entries(vec![
            confirmed("a", "first"),
            confirmed("b", "second"),
            confirmed("a", "replaced"),
        ]);
        assert_eq!(log.len(), 2);
        assert_eq!(log.get("a").unwrap().content, json!("replaced"));
    }

    #[test]
    fn test_echo_candidate_respects_window() {
        let mut log = MessageLog::new();
        let entry = ChatEntry::local(json!("hi"), "Alice", Role::User, t0());
        log.push(entry);

        let window = Duration::from_secs(10);
        let inside = t0() + chrono::Duration::seconds(2);
        let outside = t0() + chrono::Duration::seconds(20);

        assert_eq!(log.find_echo_candidate("Alice", &json!("hi"), inside, window, 40), Some(0));
        assert_eq!(log.find_echo_candidate("Alice", &json!("hi"), outside, window, 40), None);
        assert_eq!(log.find_echo_candidate("Bob", &json!("hi"), inside, window, 40), None);
        assert_eq!(log.find_echo_candidate("Alice", &json!("yo"), inside, window, 40), None);
    }

    #[test]
    fn test_echo_candidate_scans_only_recent_entries() {
        let mut log = MessageLog::new();
        log.push(ChatEntry::local(json!("hi"), "Alice", Role::User, t0()));
        for i in 0..5 {
            log.push(confirmed(&format!("c{i}"), "filler"));
        }
        let window = Duration::from_secs(10);
        assert_eq!(log.find_echo_candidate("Alice", &json!("hi"), t0(), window, 5), None);
        assert_eq!(log.find_echo_candidate("Alice", &json!("hi"), t0(), window, 6), Some(0));
    }

    #[test]
    fn test_echo_candidate_prefers_oldest_pending() {
        let mut log = MessageLog::new();
        log.push(ChatEntry::local(json!("hi"), "Alice", Role::User, t0()));
        log.push(ChatEntry::local(
            json!("hi"),
            "Alice",
            Role::User,
            t0() + chrono::Duration::seconds(1),
        ));
        let found = log.find_echo_candidate(
            "Alice",
            &json!("hi"),
            t0() + chrono::Duration::seconds(2),
            Duration::from_secs(10),
            40,
        );
        assert_eq!(found, Some(0));
    }

    #[test]
    fn test_trim_drops_oldest_confirmed() {
        let mut log = MessageLog::new();
        for i in 0..10 {
            log.push(confirmed(&format!("m{i}"), "x"));
        }
        assert_eq!(log.trim(4), 6);
        let ids: Vec<&str> = log.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["m6", "m7", "m8", "m9"]);
        assert_eq!(log.trim(4), 0);
    }

    #[test]
    fn test_trim_keeps_pending() {
        let mut log = MessageLog::new();
        let pending = ChatEntry::local(json!("wait"), "Alice", Role::User, t0());
        let pending_id = pending.id.clone();
        log.push(pending);
        for i in 0..5 {
            log.push(confirmed(&format!("m{i}"), "x"));
        }

        assert_eq!(log.trim(3), 3);
        assert!(log.get(&pending_id).is_some());
        let ids: Vec<&str> = log.entries().iter().skip(1).map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m4"]);
    }

    #[test]
    fn test_trim_never_drops_newest() {
        let mut log = MessageLog::new();
        log.push(ChatEntry::local(json!("a"), "Alice", Role::User, t0()));
        log.push(ChatEntry::local(json!("b"), "Alice", Role::User, t0()));
        log.push(confirmed("newest", "x"));

        assert_eq!(log.trim(2), 0);
        assert_eq!(log.len(), 3);
        assert_eq!(log.pending_count(), 2);
    }

    #[test]
    fn test_snapshot_serializes_pending_flag() {
        let snapshot = RoomSnapshot {
            messages: vec![ChatEntry::local(json!("hi"), "Alice", Role::User, t0())],
            participants: Vec::new(),
        };
        let text = serde_json::to_string(&snapshot).unwrap();
        assert!(text.contains(r#""pending":true"#));
        let back: RoomSnapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(back, snapshot);
    }
}
