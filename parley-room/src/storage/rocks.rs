//! RocksDB-backed room store.
//!
//! Column families:
//! - `messages`:     JSON message list per room, keyed by room id
//! - `participants`: JSON participant list per room, keyed by room id
//!
//! A save writes both values in one atomic batch, so a reader never sees
//! the messages of one save next to the participants of another.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{decode_snapshot, encode_messages, encode_participants, RoomStore, StoreError};
use crate::room::RoomSnapshot;

const CF_MESSAGES: &str = "messages";
const CF_PARTICIPANTS: &str = "participants";

const COLUMN_FAMILIES: &[&str] = &[CF_MESSAGES, CF_PARTICIPANTS];

/// Where and how a [`RocksStore`] keeps room state.
///
/// Each room is two small values rewritten on every change, so only the
/// cache and durability knobs are exposed.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Shared block cache for recently entered rooms, in bytes.
    pub cache_bytes: usize,
    /// Wait for the write-ahead log to reach disk before a save returns.
    pub durable_saves: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("parley_data")
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache_bytes: 8 * 1024 * 1024,
            durable_saves: false,
        }
    }

    /// Small cache for throwaway directories.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            cache_bytes: 512 * 1024,
            ..Self::new(path)
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed room store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.cache_bytes);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::debug!("Opened room store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(cache: &Cache) -> Options {
        let mut opts = Options::default();

        // Point lookups by room id only.
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        // Message lists are repetitive JSON.
        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }

    /// Room ids with a stored message list, in key order.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let room = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::DeserializationError("Invalid room id key".into()))?;
            rooms.push(room);
        }
        Ok(rooms)
    }

    /// Remove everything stored for a room.
    pub fn delete_room(&self, room_id: &str) -> Result<(), StoreError> {
        let cf_messages = self.cf(CF_MESSAGES)?;
        let cf_participants = self.cf(CF_PARTICIPANTS)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_messages, room_id.as_bytes());
        batch.delete_cf(cf_participants, room_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl RoomStore for RocksStore {
    fn load(&self, room_id: &str) -> Result<Option<RoomSnapshot>, StoreError> {
        let messages = self.db.get_cf(self.cf(CF_MESSAGES)?, room_id.as_bytes())?;
        let participants = self.db.get_cf(self.cf(CF_PARTICIPANTS)?, room_id.as_bytes())?;
        decode_snapshot(messages.as_deref(), participants.as_deref())
    }

    fn save(&self, room_id: &str, snapshot: &RoomSnapshot) -> Result<(), StoreError> {
        let messages = encode_messages(&snapshot.messages)?;
        let participants = encode_participants(&snapshot.participants)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_MESSAGES)?, room_id.as_bytes(), &messages);
        batch.put_cf(self.cf(CF_PARTICIPANTS)?, room_id.as_bytes(), &participants);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.durable_saves);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatMessage, Participant, Role, Status};
    use crate::room::ChatEntry;
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn snapshot(texts: &[&str]) -> RoomSnapshot {
        RoomSnapshot {
            messages: texts
                .iter()
                .enumerate()
                .map(|(i, text)| {
                    ChatEntry::confirmed(ChatMessage {
                        id: format!("m-{i}"),
                        content: json!(text),
                        user: "Bob".into(),
                        role: Role::User,
                        created_at: None,
                    })
                })
                .collect(),
            participants: vec![Participant::new("Bob", Status::Online)],
        }
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert!(store.list_rooms().unwrap().is_empty());
    }

    #[test]
    fn test_save_load() {
        let (_dir, store) = open_temp();
        let snap = snapshot(&["one", "two"]);
        store.save("lobby", &snap).unwrap();
        assert_eq!(store.load("lobby").unwrap(), Some(snap));
    }

    #[test]
    fn test_load_missing_room() {
        let (_dir, store) = open_temp();
        assert_eq!(store.load("nowhere").unwrap(), None);
    }

    #[test]
    fn test_save_overwrites() {
        let (_dir, store) = open_temp();
        store.save("lobby", &snapshot(&["one", "two"])).unwrap();
        store.save("lobby", &snapshot(&["three"])).unwrap();

        let loaded = store.load("lobby").unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].content, json!("three"));
    }

    #[test]
    fn test_rooms_are_isolated() {
        let (_dir, store) = open_temp();
        store.save("a", &snapshot(&["in a"])).unwrap();
        store.save("b", &snapshot(&["in b", "also b"])).unwrap();

        assert_eq!(store.load("a").unwrap().unwrap().messages.len(), 1);
        assert_eq!(store.load("b").unwrap().unwrap().messages.len(), 2);
        assert_eq!(store.list_rooms().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_delete_room() {
        let (_dir, store) = open_temp();
        store.save("lobby", &snapshot(&["x"])).unwrap();
        store.delete_room("lobby").unwrap();
        assert_eq!(store.load("lobby").unwrap(), None);
        assert!(store.list_rooms().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(&["durable"]);
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save("lobby", &snap).unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load("lobby").unwrap(), Some(snap));
    }

    #[test]
    fn test_durable_saves() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            durable_saves: true,
            ..StoreConfig::for_testing(dir.path())
        };
        let store = RocksStore::open(config).unwrap();
        store.save("lobby", &snapshot(&["synced"])).unwrap();
        assert_eq!(store.load("lobby").unwrap().unwrap().messages.len(), 1);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("parley_data"));
        assert!(!config.durable_saves);
        assert_eq!(StoreConfig::new("/tmp/x").cache_bytes, config.cache_bytes);
        assert!(StoreConfig::for_testing("/tmp/x").cache_bytes < config.cache_bytes);
    }
}
