//! In-process room channel.
//!
//! Every room id maps to one tokio broadcast channel. A frame sent by any
//! member is delivered to all members of that room, the sender included,
//! which is exactly what a relay does. Rooms are isolated from each other.
//!
//! Slow members that fall more than `capacity` frames behind skip the
//! frames they missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

use super::{ChannelEvent, ChannelHandle};

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub rooms: usize,
}

struct AtomicLoopbackStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Shared fan-out for any number of rooms. Cheap to clone.
#[derive(Clone)]
pub struct LoopbackHub {
    rooms: Arc<RwLock<HashMap<String, broadcast::Sender<Arc<str>>>>>,
    capacity: usize,
    stats: Arc<AtomicLoopbackStats>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl LoopbackHub {
    /// Create a hub buffering up to `capacity` frames per member.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicLoopbackStats {
                frames_sent: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    async fn room_sender(&self, room_id: &str) -> broadcast::Sender<Arc<str>> {
        {
            let rooms = self.rooms.read().await;
            if let Some(sender) = rooms.get(room_id) {
                return sender.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Join `room_id` and return a channel handle for it.
    ///
    /// The handle sees `Open` right away, then every frame any member of
    /// the room sends after this call.
    pub async fn join(&self, room_id: impl Into<String>) -> ChannelHandle {
        let room_id = room_id.into();
        let sender = self.room_sender(&room_id).await;
        let mut inbound = sender.subscribe();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.capacity);
        let (evt_tx, evt_rx) = mpsc::channel(self.capacity);

        // Open is the first event; the buffer cannot be full yet.
        let _ = evt_tx.try_send(ChannelEvent::Open);

        let stats = self.stats.clone();
        let room = room_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            let _ = sender.send(Arc::from(frame));
                            stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        None => break,
                    },
                    received = inbound.recv() => match received {
                        Ok(frame) => {
                            if evt_tx.send(ChannelEvent::Frame(frame.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("Room {room}: member lagged, skipped {skipped} frames");
                            stats.frames_dropped.fetch_add(skipped, Ordering::Relaxed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            log::debug!("Room {room}: loopback member left");
        });

        ChannelHandle::from_parts(room_id, out_tx, evt_rx)
    }

    /// Number of rooms anyone has joined so far.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            rooms: self.room_count().await,
        }
    }
}
