//! Room channel: an opaque bidirectional text channel keyed by room id.
//!
//! A [`ChannelHandle`] is what the session talks to. The bindings behind it
//! only move text frames; they never look inside an envelope.
//!
//! - [`ws`]: WebSocket client with offline queue and reconnect backoff
//! - [`loopback`]: in-process fan-out for tests and embedding

pub mod loopback;
pub mod ws;

use tokio::sync::mpsc;

/// Something that happened on a room channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is (again) connected to the relay.
    Open,
    /// One text frame delivered by the relay.
    Frame(String),
    /// The connection was lost. A reconnecting binding may follow up with
    /// another `Open`.
    Closed,
}

/// Errors returned when handing a frame to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The channel task is gone.
    Closed,
    /// The outgoing buffer is full.
    Full,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Closed => write!(f, "Channel closed"),
            SendError::Full => write!(f, "Channel outgoing buffer full"),
        }
    }
}

impl std::error::Error for SendError {}

/// Session-side end of a room channel.
pub struct ChannelHandle {
    room_id: String,
    outgoing: mpsc::Sender<String>,
    events: mpsc::Receiver<ChannelEvent>,
}

impl ChannelHandle {
    /// Assemble a handle from the two halves a binding task holds the
    /// other ends of.
    pub fn from_parts(
        room_id: impl Into<String>,
        outgoing: mpsc::Sender<String>,
        events: mpsc::Receiver<ChannelEvent>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            outgoing,
            events,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Hand a frame to the binding without waiting.
    pub fn send(&self, frame: String) -> Result<(), SendError> {
        self.outgoing.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Next channel event, or `None` once the binding has shut down.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }
}
