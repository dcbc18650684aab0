//! In-memory string key-value store.
//!
//! Mirrors the shape of browser local storage: one string value per key,
//! two keys per room.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{
    decode_snapshot, encode_messages, encode_participants, messages_key, participants_key,
    RoomStore, StoreError,
};
use crate::room::RoomSnapshot;

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value under `key`.
    pub fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.lock()?;
        Ok(values.get(key).cloned())
    }

    /// Write a raw value, bypassing serialization.
    pub fn set_raw(&self, key: impl Into<String>, value: impl Into<String>) -> Result<(), StoreError> {
        let mut values = self.lock()?;
        values.insert(key.into(), value.into());
        Ok(())
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.values
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

fn into_string(bytes: Vec<u8>) -> Result<String, StoreError> {
    String::from_utf8(bytes).map_err(|e| StoreError::SerializationError(e.to_string()))
}

impl RoomStore for MemoryStore {
    fn load(&self, room_id: &str) -> Result<Option<RoomSnapshot>, StoreError> {
        let values = self.lock()?;
        let messages = values.get(&messages_key(room_id));
        let participants = values.get(&participants_key(room_id));
        decode_snapshot(
            messages.map(|s| s.as_bytes()),
            participants.map(|s| s.as_bytes()),
        )
    }

    fn save(&self, room_id: &str, snapshot: &RoomSnapshot) -> Result<(), StoreError> {
        let messages = into_string(encode_messages(&snapshot.messages)?)?;
        let participants = into_string(encode_participants(&snapshot.participants)?)?;

        let mut values = self.lock()?;
        values.insert(messages_key(room_id), messages);
        values.insert(participants_key(room_id), participants);
        Ok(())
    }
}
