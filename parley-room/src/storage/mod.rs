//! Room persistence.
//!
//! ```text
//! ┌─────────────┐  save(room, snapshot)  ┌──────────────────────────────┐
//! │ RoomSession │ ─────────────────────► │ RoomStore                    │
//! │ (engine)    │ ◄───────────────────── │  MemoryStore  "{room}:messages"
//! └─────────────┘  load(room) on entry   │               "{room}:participants"
//!                                        │  RocksStore   CF messages / participants
//!                                        └──────────────────────────────┘
//! ```
//!
//! Each room persists as two JSON values: the message list and the
//! participant list. A store never interprets them beyond (de)serializing.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use std::sync::Arc;

use crate::protocol::Participant;
use crate::room::{ChatEntry, RoomSnapshot};

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Backend failure (RocksDB, poisoned lock, ...)
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// A stored value could not be parsed
    DeserializationError(String),
    /// The store is not accepting reads or writes
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistence port for room state.
pub trait RoomStore: Send + Sync {
    /// Load the persisted state of a room, or `None` if nothing was saved.
    fn load(&self, room_id: &str) -> Result<Option<RoomSnapshot>, StoreError>;

    /// Replace the persisted state of a room.
    fn save(&self, room_id: &str, snapshot: &RoomSnapshot) -> Result<(), StoreError>;
}

impl<S: RoomStore + ?Sized> RoomStore for Arc<S> {
    fn load(&self, room_id: &str) -> Result<Option<RoomSnapshot>, StoreError> {
        (**self).load(room_id)
    }

    fn save(&self, room_id: &str, snapshot: &RoomSnapshot) -> Result<(), StoreError> {
        (**self).save(room_id, snapshot)
    }
}

impl<S: RoomStore + ?Sized> RoomStore for Box<S> {
    fn load(&self, room_id: &str) -> Result<Option<RoomSnapshot>, StoreError> {
        (**self).load(room_id)
    }

    fn save(&self, room_id: &str, snapshot: &RoomSnapshot) -> Result<(), StoreError> {
        (**self).save(room_id, snapshot)
    }
}

pub(crate) fn messages_key(room_id: &str) -> String {
    format!("{room_id}:messages")
}

pub(crate) fn participants_key(room_id: &str) -> String {
    format!("{room_id}:participants")
}

pub(crate) fn encode_messages(messages: &[ChatEntry]) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(messages).map_err(|e| StoreError::SerializationError(e.to_string()))
}

pub(crate) fn encode_participants(participants: &[Participant]) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(participants).map_err(|e| StoreError::SerializationError(e.to_string()))
}

/// Rebuild a snapshot from the two stored values. `None` when neither
/// exists; a missing half loads as empty.
pub(crate) fn decode_snapshot(
    messages: Option<&[u8]>,
    participants: Option<&[u8]>,
) -> Result<Option<RoomSnapshot>, StoreError> {
    if messages.is_none() && participants.is_none() {
        return Ok(None);
    }

    let messages = match messages {
        Some(bytes) => serde_json::from_slice(bytes)
            .map_err(|e| StoreError::DeserializationError(format!("messages: {e}")))?,
        None => Vec::new(),
    };
    let participants = match participants {
        Some(bytes) => serde_json::from_slice(bytes)
            .map_err(|e| StoreError::DeserializationError(format!("participants: {e}")))?,
        None => Vec::new(),
    };

    Ok(Some(RoomSnapshot {
        messages,
        participants,
    }))
}
