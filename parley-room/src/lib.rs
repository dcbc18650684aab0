//! # parley-room: Real-time room chat protocol and client reconciliation
//!
//! Clients of a room exchange JSON envelopes through a relay that fans every
//! frame out to all members, the sender included. Each client keeps its own
//! message log and roster and converges with the others by reconciling
//! echoes of its optimistic local writes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   text frames    ┌─────────────┐
//! │ RoomSession │ ◄──────────────► │   relay     │ ◄──► other clients
//! │ (per user)  │  ChannelHandle   │ (fan-out)   │
//! └──────┬──────┘                  └─────────────┘
//!        │
//!        ▼
//! ┌─────────────┐     save/load    ┌─────────────┐
//! │ RoomEngine  │ ───────────────► │ RoomStore   │
//! │ log+roster  │                  │ mem / rocks │
//! └─────────────┘                  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope model and codec
//! - [`room`]: Message log and room snapshot
//! - [`engine`]: Pending→confirmed reconciliation
//! - [`presence`]: Roster and heartbeat constants
//! - [`mention`]: Mention and unread classification
//! - [`channel`]: WebSocket and in-process room channels
//! - [`storage`]: Persistence port with memory and RocksDB backends
//! - [`session`]: Event loop tying it all together

pub mod protocol;
pub mod room;
pub mod engine;
pub mod presence;
pub mod mention;
pub mod channel;
pub mod storage;
pub mod session;

// Re-exports for convenience
pub use protocol::{
    ChatMessage, Envelope, MessageUpdate, Participant, Presence, ProtocolError, Role, Status,
};
pub use room::{ChatEntry, MessageLog, RoomSnapshot};
pub use engine::{EngineConfig, RoomEngine, StateDelta};
pub use presence::{Roster, DEFAULT_HEARTBEAT_INTERVAL};
pub use mention::{mentions, unread_summary, UnreadSummary};
pub use channel::{ChannelEvent, ChannelHandle, SendError};
pub use channel::loopback::{LoopbackHub, LoopbackStats};
pub use channel::ws::{OfflineQueue, WsChannel, WsConfig};
pub use storage::{MemoryStore, RocksStore, RoomStore, StoreConfig, StoreError};
pub use session::{RoomSession, RoomView, SessionCommand, SessionConfig, SessionHandle};
