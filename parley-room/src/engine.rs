//! Client reconciliation engine for one room.
//!
//! ## Reconciliation
//!
//! ```text
//! append_local()                         apply_inbound(add)
//!       │                                       │
//!       ▼                                       ▼
//!  ChatEntry{pending}  ◄── exact id? ───── envelope id
//!       │              ◄── same user+content, created within window,
//!       │                  among the newest N entries? (oldest first)
//!       ▼                                       │ neither
//!  confirmed (relay fields win)                 ▼
//!                                        append as confirmed
//! ```
//!
//! The engine never asks "is this my own echo" by sender identity: the relay
//! may or may not preserve the id this client generated, so echoes are
//! recognised by id first and by content second.
//!
//! The engine is a plain state machine. It does no I/O; the session layer
//! feeds it events one at a time and writes the results through.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::mention::{self, UnreadSummary};
use crate::presence::{Roster, DEFAULT_HEARTBEAT_INTERVAL, STALE_HEARTBEATS};
use crate::protocol::{ChatMessage, Envelope, MessageUpdate, Participant, Presence, Role, Status};
use crate::room::{ChatEntry, MessageLog, RoomSnapshot};

/// Reconciliation and retention tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long after a local send an equal-content echo still confirms it.
    pub echo_window: Duration,
    /// How many of the newest log entries are scanned for an echo match.
    pub echo_scan_depth: usize,
    /// Maximum number of log entries kept (pending entries excepted).
    pub retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            echo_window: Duration::from_secs(10),
            echo_scan_depth: 40,
            retention: 300,
        }
    }
}

impl EngineConfig {
    /// Small retention for tests.
    pub fn for_testing() -> Self {
        Self {
            retention: 16,
            ..Self::default()
        }
    }
}

/// What a single event did to the room state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateDelta {
    /// Event understood, state already reflected it.
    Unchanged,
    /// Event dropped: undecodable, unknown kind, or an update for an unseen id.
    Ignored,
    /// A new confirmed entry was appended.
    Appended { id: String },
    /// A pending entry was confirmed. `previous_id` differs from `id` when
    /// the match was by content rather than by id.
    Confirmed { id: String, previous_id: String },
    /// A confirmed entry was overwritten.
    Replaced { id: String },
    /// A history snapshot was merged.
    Merged { appended: usize, confirmed: usize, replaced: usize },
    /// The roster changed.
    Roster,
}

impl StateDelta {
    /// Whether persistence and renderers need to hear about this event.
    pub fn is_change(&self) -> bool {
        match self {
            StateDelta::Unchanged | StateDelta::Ignored => false,
            StateDelta::Merged {
                appended,
                confirmed,
                replaced,
            } => appended + confirmed + replaced > 0,
            _ => true,
        }
    }

    /// Whether the message log changed.
    pub fn touches_log(&self) -> bool {
        self.is_change() && !matches!(self, StateDelta::Roster)
    }
}

/// Authoritative local view of one room.
pub struct RoomEngine {
    room_id: String,
    local_user: String,
    /// Per-session identifier carried in presence envelopes.
    session_id: String,
    config: EngineConfig,
    log: MessageLog,
    roster: Roster,
}

impl RoomEngine {
    /// Create an empty engine for `local_user` in `room_id`.
    pub fn new(room_id: impl Into<String>, local_user: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            room_id: room_id.into(),
            local_user: local_user.into(),
            session_id: Uuid::new_v4().to_string(),
            config,
            log: MessageLog::new(),
            roster: Roster::new(),
        }
    }

    /// Load persisted state. Duplicate ids and users collapse, and the
    /// retention cap is applied.
    pub fn restore(&mut self, snapshot: RoomSnapshot) {
        self.log = MessageLog::from_entries(snapshot.messages);
        self.roster = Roster::from_participants(snapshot.participants);
        self.log.trim(self.config.retention);
        log::debug!(
            "Room {}: restored {} messages ({} pending), {} participants",
            self.room_id,
            self.log.len(),
            self.log.pending_count(),
            self.roster.len()
        );
    }

    // ─── Local writes ────────────────────────────────────────────────

    /// Append a pending entry for a message the local user is sending.
    ///
    /// The caller transmits `entry.to_add_envelope()`.
    pub fn append_local(&mut self, content: Value, user: &str, role: Role) -> ChatEntry {
        self.append_local_at(content, user, role, Utc::now())
    }

    /// [`append_local`](Self::append_local) with an explicit clock.
    pub fn append_local_at(&mut self, content: Value, user: &str, role: Role, now: DateTime<Utc>) -> ChatEntry {
        let entry = ChatEntry::local(content, user, role, now);
        self.log.push(entry.clone());
        self.trim_log();
        entry
    }

    /// Overwrite the content of an existing entry and return the `update`
    /// envelope to transmit, or `None` if the id is unknown.
    ///
    /// Editing a pending entry keeps it pending: only a relay echo confirms.
    pub fn edit_local(&mut self, id: &str, content: Value) -> Option<Envelope> {
        let idx = self.log.position(id)?;
        let entry = self.log.entry_mut(idx);
        entry.content = content;
        Some(Envelope::update(
            entry.id.clone(),
            entry.content.clone(),
            entry.user.clone(),
            entry.role,
        ))
    }

    /// Build the local presence envelope and apply it to the roster right
    /// away, without waiting for the relay to echo it.
    pub fn announce(&mut self, status: Status, now: DateTime<Utc>) -> Envelope {
        let presence = Presence {
            user: self.local_user.clone(),
            status,
            id: self.session_id.clone(),
            last_seen: now,
        };
        self.roster.upsert(Participant::from(presence.clone()));
        Envelope::Presence(presence)
    }

    // ─── Inbound ─────────────────────────────────────────────────────

    /// Decode a text frame and apply it. Undecodable frames are logged and
    /// dropped without touching state.
    pub fn apply_frame(&mut self, frame: &str) -> StateDelta {
        self.apply_frame_at(frame, Utc::now())
    }

    /// [`apply_frame`](Self::apply_frame) with an explicit clock.
    pub fn apply_frame_at(&mut self, frame: &str, now: DateTime<Utc>) -> StateDelta {
        match Envelope::decode_str(frame) {
            Ok(envelope) => self.apply_inbound_at(&envelope, now),
            Err(e) => {
                log::warn!("Room {}: dropping frame: {e}", self.room_id);
                StateDelta::Ignored
            }
        }
    }

    /// Apply one envelope delivered by the room channel.
    pub fn apply_inbound(&mut self, envelope: &Envelope) -> StateDelta {
        self.apply_inbound_at(envelope, Utc::now())
    }

    /// [`apply_inbound`](Self::apply_inbound) with an explicit clock.
    pub fn apply_inbound_at(&mut self, envelope: &Envelope, now: DateTime<Utc>) -> StateDelta {
        match envelope {
            Envelope::Add(message) => {
                let delta = self.reconcile(message, now);
                if matches!(delta, StateDelta::Appended { .. }) {
                    self.trim_log();
                }
                delta
            }
            Envelope::Update(update) => self.apply_update(update),
            Envelope::Presence(presence) => {
                if self.roster.upsert(Participant::from(presence.clone())) {
                    StateDelta::Roster
                } else {
                    StateDelta::Unchanged
                }
            }
            Envelope::Participants { participants } => {
                if self.roster.replace(participants.clone()) {
                    StateDelta::Roster
                } else {
                    StateDelta::Unchanged
                }
            }
            Envelope::All { messages } => self.merge_history(messages, now),
            Envelope::Unknown { kind } => {
                log::debug!("Room {}: ignoring unknown envelope type {kind:?}", self.room_id);
                StateDelta::Ignored
            }
        }
    }

    /// Match an `add` against the log: exact id, then echo heuristics,
    /// then append.
    fn reconcile(&mut self, message: &ChatMessage, now: DateTime<Utc>) -> StateDelta {
        if let Some(idx) = self.log.position(&message.id) {
            let entry = self.log.entry_mut(idx);
            if !entry.pending && entry.matches(message) {
                return StateDelta::Unchanged;
            }
            let was_pending = entry.pending;
            entry.absorb(message.clone());
            return if was_pending {
                StateDelta::Confirmed {
                    id: message.id.clone(),
                    previous_id: message.id.clone(),
                }
            } else {
                StateDelta::Replaced {
                    id: message.id.clone(),
                }
            };
        }

        if let Some(idx) = self.log.find_echo_candidate(
            &message.user,
            &message.content,
            now,
            self.config.echo_window,
            self.config.echo_scan_depth,
        ) {
            let entry = self.log.entry_mut(idx);
            let previous_id = std::mem::take(&mut entry.id);
            entry.absorb(message.clone());
            log::debug!(
                "Room {}: confirmed {previous_id} as {} by content",
                self.room_id,
                message.id
            );
            return StateDelta::Confirmed {
                id: message.id.clone(),
                previous_id,
            };
        }

        self.log.push(ChatEntry::confirmed(message.clone()));
        StateDelta::Appended {
            id: message.id.clone(),
        }
    }

    /// Exact-id overwrite. Updates for ids never seen are dropped rather
    /// than inserted.
    fn apply_update(&mut self, update: &MessageUpdate) -> StateDelta {
        let idx = match self.log.position(&update.id) {
            Some(idx) => idx,
            None => {
                log::debug!(
                    "Room {}: dropping update for unknown id {}",
                    self.room_id,
                    update.id
                );
                return StateDelta::Ignored;
            }
        };

        let entry = self.log.entry_mut(idx);
        let was_pending = entry.pending;
        if !entry.overwrite(update) {
            return StateDelta::Unchanged;
        }
        if was_pending {
            StateDelta::Confirmed {
                id: update.id.clone(),
                previous_id: update.id.clone(),
            }
        } else {
            StateDelta::Replaced {
                id: update.id.clone(),
            }
        }
    }

    /// Merge a history snapshot message by message. Pending entries the
    /// snapshot does not mention stay in place.
    fn merge_history(&mut self, messages: &[ChatMessage], now: DateTime<Utc>) -> StateDelta {
        let (mut appended, mut confirmed, mut replaced) = (0, 0, 0);
        for message in messages {
            match self.reconcile(message, now) {
                StateDelta::Appended { .. } => appended += 1,
                StateDelta::Confirmed { .. } => confirmed += 1,
                StateDelta::Replaced { .. } => replaced += 1,
                _ => {}
            }
        }
        self.trim_log();
        log::debug!(
            "Room {}: history merged ({appended} new, {confirmed} confirmed, {replaced} replaced)",
            self.room_id
        );
        StateDelta::Merged {
            appended,
            confirmed,
            replaced,
        }
    }

    // ─── Maintenance ─────────────────────────────────────────────────

    /// Apply the retention cap. Returns the number of dropped entries.
    pub fn trim_log(&mut self) -> usize {
        let dropped = self.log.trim(self.config.retention);
        if dropped > 0 {
            log::debug!("Room {}: trimmed {dropped} old messages", self.room_id);
        }
        dropped
    }

    /// Mark remote participants silent for longer than `timeout` offline.
    pub fn expire_stale(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        self.roster.expire_stale(now, timeout, &self.local_user)
    }

    // ─── Reads ───────────────────────────────────────────────────────

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn entries(&self) -> &[ChatEntry] {
        self.log.entries()
    }

    pub fn entry(&self, id: &str) -> Option<&ChatEntry> {
        self.log.get(id)
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Copy of the current state for persistence and renderers.
    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            messages: self.log.entries().to_vec(),
            participants: self.roster.participants().to_vec(),
        }
    }

    /// Unread counters for the local user.
    pub fn unread_summary(&self, last_read_id: Option<&str>) -> UnreadSummary {
        mention::unread_summary(self.log.entries(), last_read_id, &self.local_user)
    }
}

/// Default silence after which a participant is expired: a few missed
/// heartbeats.
pub fn default_stale_timeout() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL * STALE_HEARTBEATS
}
