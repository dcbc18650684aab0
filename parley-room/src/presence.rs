//! Room roster and liveness rules.
//!
//! ## Data flow
//!
//! ```text
//! heartbeat tick / room entry / room exit
//!       │
//!       ▼
//! RoomEngine::announce()  ──► presence envelope (sent)
//!       │
//!       ▼  (optimistic, before any echo)
//! Roster::upsert()
//!
//! inbound presence      ──► Roster::upsert()   (merge by user)
//! inbound participants  ──► Roster::replace()  (authoritative snapshot)
//! heartbeat tick        ──► Roster::expire_stale()
//! ```
//!
//! The roster holds at most one [`Participant`] per user name.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::protocol::{Participant, Status};

/// Default interval between `online` re-announcements.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Missed heartbeats after which a silent participant is shown offline.
pub const STALE_HEARTBEATS: u32 = 3;

/// Participants currently known for a room, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a roster from a list, collapsing repeated users (last one wins).
    pub fn from_participants(participants: Vec<Participant>) -> Self {
        let mut roster = Self::new();
        roster.replace(participants);
        roster
    }

    /// Merge a participant into the roster.
    ///
    /// An existing entry for the same user takes the new `status`, and the
    /// new `id`/`lastSeen` when present. Returns `true` if anything changed,
    /// so re-applying the same presence is a no-op.
    pub fn upsert(&mut self, incoming: Participant) -> bool {
        match self.participants.iter_mut().find(|p| p.user == incoming.user) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.status = incoming.status;
                if incoming.id.is_some() {
                    merged.id = incoming.id;
                }
                if incoming.last_seen.is_some() {
                    merged.last_seen = incoming.last_seen;
                }
                if *existing == merged {
                    return false;
                }
                *existing = merged;
                true
            }
            None => {
                self.participants.push(incoming);
                true
            }
        }
    }

    /// Replace the whole roster with an authoritative snapshot.
    ///
    /// Returns `true` if the roster differs from before.
    pub fn replace(&mut self, participants: Vec<Participant>) -> bool {
        let mut next: Vec<Participant> = Vec::with_capacity(participants.len());
        for p in participants {
            match next.iter_mut().find(|q| q.user == p.user) {
                Some(slot) => *slot = p,
                None => next.push(p),
            }
        }
        if next == self.participants {
            return false;
        }
        self.participants = next;
        true
    }

    /// Mark participants silent for longer than `timeout` as offline.
    ///
    /// `keep` (the local user) is never expired. Participants without a
    /// `lastSeen` are left alone since nothing says when they were last
    /// heard. Returns the users that went offline.
    pub fn expire_stale(&mut self, now: DateTime<Utc>, timeout: Duration, keep: &str) -> Vec<String> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let mut expired = Vec::new();
        for p in self.participants.iter_mut() {
            if p.user == keep || p.status == Status::Offline {
                continue;
            }
            let silent = p
                .last_seen
                .map_or(false, |seen| now.signed_duration_since(seen) > timeout);
            if silent {
                p.status = Status::Offline;
                expired.push(p.user.clone());
            }
        }
        expired
    }

    pub fn get(&self, user: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user == user)
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Participants currently online.
    pub fn online(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.is_online())
    }

    pub fn online_count(&self) -> usize {
        self.online().count()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
