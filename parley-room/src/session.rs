//! Session driver: the event loop around one [`RoomEngine`].
//!
//! ## Event loop
//!
//! ```text
//!             ┌──────────── ChannelHandle ────────────┐
//!             │ Open / Frame / Closed       send(frame)│
//!             ▼                                  ▲     │
//!  ┌─────────────────────────────────────────────┴───┐ │
//!  │ RoomSession::run   (tokio::select!, one at a time)│
//!  │   frame     → engine.apply_frame                 │
//!  │   heartbeat → announce(online) + expire_stale    │
//!  │   command   → append_local / edit_local / leave  │
//!  └──────┬───────────────────────────────┬───────────┘
//!         │ save(room, snapshot)          │ send_replace(RoomView)
//!         ▼                               ▼
//!     RoomStore                      watch::Receiver (renderer)
//! ```
//!
//! Every change is written through to the store and published before the
//! next event is taken. Store and channel failures are logged; the session
//! keeps running in memory.

use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::channel::{ChannelEvent, ChannelHandle, SendError};
use crate::engine::{default_stale_timeout, EngineConfig, RoomEngine, StateDelta};
use crate::mention::UnreadSummary;
use crate::presence::DEFAULT_HEARTBEAT_INTERVAL;
use crate::protocol::{Envelope, Role, Status};
use crate::room::RoomSnapshot;
use crate::storage::RoomStore;

/// Session timing and engine tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between `online` re-announcements.
    pub heartbeat_interval: Duration,
    /// Silence after which remote participants are marked offline.
    pub stale_after: Duration,
    pub engine: EngineConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_after: default_stale_timeout(),
            engine: EngineConfig::default(),
        }
    }
}

/// Local user actions fed into a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Send a new message.
    Send { content: Value, role: Role },
    /// Replace the content of an existing message.
    Edit { id: String, content: Value },
    /// Move the read marker (unread counters restart after this id).
    MarkRead(Option<String>),
    /// Announce offline, persist and stop.
    Leave,
}

impl SessionCommand {
    /// Plain text message from the local user.
    pub fn say(text: impl Into<String>) -> Self {
        SessionCommand::Send {
            content: Value::String(text.into()),
            role: Role::User,
        }
    }
}

/// What a renderer sees of a room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomView {
    pub room_id: String,
    pub local_user: String,
    pub snapshot: RoomSnapshot,
    pub unread: UnreadSummary,
    /// Whether the channel is currently open.
    pub connected: bool,
}

/// One user's presence in one room.
pub struct RoomSession<S> {
    engine: RoomEngine,
    store: S,
    channel: ChannelHandle,
    config: SessionConfig,
    last_read: Option<String>,
    connected: bool,
}

impl<S: RoomStore> RoomSession<S> {
    /// Enter the room served by `channel` as `user`.
    ///
    /// Saved state is loaded once here. A failing or corrupt store is
    /// logged and the session starts empty.
    pub fn enter(user: impl Into<String>, config: SessionConfig, store: S, channel: ChannelHandle) -> Self {
        let room_id = channel.room_id().to_owned();
        let mut engine = RoomEngine::new(room_id.as_str(), user, config.engine.clone());

        match store.load(&room_id) {
            Ok(Some(snapshot)) => engine.restore(snapshot),
            Ok(None) => log::debug!("Room {room_id}: no saved state"),
            Err(e) => log::warn!("Room {room_id}: could not load saved state, starting empty: {e}"),
        }

        Self {
            engine,
            store,
            channel,
            config,
            last_read: None,
            connected: false,
        }
    }

    pub fn engine(&self) -> &RoomEngine {
        &self.engine
    }

    /// Current view of the room.
    pub fn view(&self) -> RoomView {
        RoomView {
            room_id: self.engine.room_id().to_owned(),
            local_user: self.engine.local_user().to_owned(),
            snapshot: self.engine.snapshot(),
            unread: self.engine.unread_summary(self.last_read.as_deref()),
            connected: self.connected,
        }
    }

    /// Drive the session until `Leave` arrives or `commands` is dropped.
    ///
    /// Returns the final state after the `offline` announcement.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        view: watch::Sender<RoomView>,
    ) -> RoomSnapshot {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; entry is announced below.
        heartbeat.tick().await;

        log::info!("Room {}: entered as {}", self.engine.room_id(), self.engine.local_user());
        self.announce(Status::Online);
        self.commit(&view);

        let mut channel_alive = true;
        loop {
            tokio::select! {
                event = self.channel.recv(), if channel_alive => match event {
                    Some(event) => self.handle_channel_event(event, &view),
                    None => {
                        log::warn!("Room {}: channel shut down", self.engine.room_id());
                        channel_alive = false;
                        self.connected = false;
                        view.send_replace(self.view());
                    }
                },
                _ = heartbeat.tick() => {
                    self.announce(Status::Online);
                    let expired = self.engine.expire_stale(Utc::now(), self.config.stale_after);
                    if !expired.is_empty() {
                        log::info!("Room {}: marked offline: {}", self.engine.room_id(), expired.join(", "));
                    }
                    self.commit(&view);
                }
                command = commands.recv() => match command {
                    Some(SessionCommand::Leave) | None => break,
                    Some(command) => self.handle_command(command, &view),
                },
            }
        }

        self.announce(Status::Offline);
        self.commit(&view);
        log::info!("Room {}: left", self.engine.room_id());
        self.engine.snapshot()
    }

    /// Run on a new task and return a handle to it.
    pub fn spawn(self) -> SessionHandle
    where
        S: 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (view_tx, view_rx) = watch::channel(self.view());
        let task = tokio::spawn(self.run(command_rx, view_tx));
        SessionHandle {
            commands: command_tx,
            view: view_rx,
            task,
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent, view: &watch::Sender<RoomView>) {
        match event {
            ChannelEvent::Open => {
                self.connected = true;
                // Relays learn about us again after every reconnect.
                self.announce(Status::Online);
                self.commit(view);
            }
            ChannelEvent::Frame(frame) => {
                let delta = self.engine.apply_frame(&frame);
                if let StateDelta::Confirmed { id, previous_id } = &delta {
                    // The read marker follows an entry renamed to the relay's id.
                    if self.last_read.as_deref() == Some(previous_id.as_str()) {
                        self.last_read = Some(id.clone());
                    }
                }
                if delta.is_change() {
                    self.commit(view);
                }
            }
            ChannelEvent::Closed => {
                self.connected = false;
                view.send_replace(self.view());
            }
        }
    }

    fn handle_command(&mut self, command: SessionCommand, view: &watch::Sender<RoomView>) {
        match command {
            SessionCommand::Send { content, role } => {
                let user = self.engine.local_user().to_owned();
                let entry = self.engine.append_local(content, &user, role);
                self.transmit(&entry.to_add_envelope());
                self.commit(view);
            }
            SessionCommand::Edit { id, content } => match self.engine.edit_local(&id, content) {
                Some(envelope) => {
                    self.transmit(&envelope);
                    self.commit(view);
                }
                None => log::warn!("Room {}: cannot edit unknown message {id}", self.engine.room_id()),
            },
            SessionCommand::MarkRead(id) => {
                self.last_read = id;
                view.send_replace(self.view());
            }
            SessionCommand::Leave => {}
        }
    }

    fn announce(&mut self, status: Status) {
        let envelope = self.engine.announce(status, Utc::now());
        self.transmit(&envelope);
    }

    /// Best-effort send. Failures never touch room state.
    fn transmit(&self, envelope: &Envelope) {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Room {}: cannot encode {}: {e}", self.engine.room_id(), envelope.kind());
                return;
            }
        };
        if let Err(e) = self.channel.send(frame) {
            log::warn!("Room {}: {} not sent: {e}", self.engine.room_id(), envelope.kind());
        }
    }

    /// Write through to the store, then publish.
    fn commit(&self, view: &watch::Sender<RoomView>) {
        let snapshot = self.engine.snapshot();
        if let Err(e) = self.store.save(self.engine.room_id(), &snapshot) {
            log::warn!("Room {}: save failed, continuing in memory: {e}", self.engine.room_id());
        }
        view.send_replace(self.view());
    }
}

/// Handle to a session running on its own task.
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    view: watch::Receiver<RoomView>,
    task: JoinHandle<RoomSnapshot>,
}

impl SessionHandle {
    /// Queue a command for the session.
    pub async fn command(&self, command: SessionCommand) -> Result<(), SendError> {
        self.commands.send(command).await.map_err(|_| SendError::Closed)
    }

    /// Send a plain text message.
    pub async fn say(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.command(SessionCommand::say(text)).await
    }

    /// A receiver that observes every published view.
    pub fn subscribe(&self) -> watch::Receiver<RoomView> {
        self.view.clone()
    }

    /// Latest published view.
    pub fn current(&self) -> RoomView {
        self.view.borrow().clone()
    }

    /// Leave the room and wait for the final state.
    pub async fn leave(self) -> Result<RoomSnapshot, tokio::task::JoinError> {
        // Already stopped if this fails; the task result still tells.
        let _ = self.commands.send(SessionCommand::Leave).await;
        self.task.await
    }
}
