//! JSON envelope protocol for room channels.
//!
//! Wire format (one UTF-8 JSON object per text frame):
//! ```text
//! { "type": "add",          "id", "content", "user", "role", "created_at"? }
//! { "type": "update",       "id", "content", "user", "role" }
//! { "type": "presence",     "user", "status", "id", "lastSeen" }
//! { "type": "participants", "participants": [ { "user", "id"?, "status", "lastSeen"? } ] }
//! { "type": "all",          "messages": [ { "id", "content", "user", "role", "created_at"? } ] }
//! ```
//!
//! The `type` tag is always serialized first and always consulted first on
//! decode. Tags this build does not know decode to [`Envelope::Unknown`] so
//! newer peers can add envelope kinds without breaking older clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tag of a new chat message.
pub const KIND_ADD: &str = "add";
/// Tag of a full replacement of an existing message.
pub const KIND_UPDATE: &str = "update";
/// Tag of a liveness announcement.
pub const KIND_PRESENCE: &str = "presence";
/// Tag of an authoritative roster snapshot.
pub const KIND_PARTICIPANTS: &str = "participants";
/// Tag of a history snapshot pushed by the relay on connect.
pub const KIND_ALL: &str = "all";

const KNOWN_KINDS: &[&str] = &[KIND_ADD, KIND_UPDATE, KIND_PRESENCE, KIND_PARTICIPANTS, KIND_ALL];

/// Author role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
}

/// Liveness of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Offline,
}

/// A chat message as it travels in `add` and `all` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    /// Opaque payload: plain text or a self-describing image reference.
    pub content: Value,
    pub user: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Body of an `update` envelope: every mutable field, never a partial patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub id: String,
    pub content: Value,
    pub user: String,
    pub role: Role,
}

/// Body of a `presence` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub user: String,
    pub status: Status,
    /// Per-session client identifier (not a message id).
    pub id: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: DateTime<Utc>,
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: Status,
    #[serde(rename = "lastSeen", default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn new(user: impl Into<String>, status: Status) -> Self {
        Self {
            user: user.into(),
            id: None,
            status,
            last_seen: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == Status::Online
    }
}

impl From<Presence> for Participant {
    fn from(p: Presence) -> Self {
        Self {
            user: p.user,
            id: Some(p.id),
            status: p.status,
            last_seen: Some(p.last_seen),
        }
    }
}

/// Top-level wire unit exchanged over a room channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Add(ChatMessage),
    Update(MessageUpdate),
    Presence(Presence),
    Participants { participants: Vec<Participant> },
    All { messages: Vec<ChatMessage> },
    /// Any tag this build does not understand. Applied as a no-op.
    #[serde(skip)]
    Unknown { kind: String },
}

impl Envelope {
    /// Create an `add` envelope.
    pub fn add(message: ChatMessage) -> Self {
        Envelope::Add(message)
    }

    /// Create an `update` envelope.
    pub fn update(
        id: impl Into<String>,
        content: Value,
        user: impl Into<String>,
        role: Role,
    ) -> Self {
        Envelope::Update(MessageUpdate {
            id: id.into(),
            content,
            user: user.into(),
            role,
        })
    }

    /// Create a `presence` envelope.
    pub fn presence(
        user: impl Into<String>,
        status: Status,
        session_id: impl Into<String>,
        last_seen: DateTime<Utc>,
    ) -> Self {
        Envelope::Presence(Presence {
            user: user.into(),
            status,
            id: session_id.into(),
            last_seen,
        })
    }

    /// Create a `participants` roster snapshot.
    pub fn participants(participants: Vec<Participant>) -> Self {
        Envelope::Participants { participants }
    }

    /// Create an `all` history snapshot.
    pub fn all(messages: Vec<ChatMessage>) -> Self {
        Envelope::All { messages }
    }

    /// The wire tag of this envelope.
    pub fn kind(&self) -> &str {
        match self {
            Envelope::Add(_) => KIND_ADD,
            Envelope::Update(_) => KIND_UPDATE,
            Envelope::Presence(_) => KIND_PRESENCE,
            Envelope::Participants { .. } => KIND_PARTICIPANTS,
            Envelope::All { .. } => KIND_ALL,
            Envelope::Unknown { kind } => kind,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        match self {
            // Only the tag survives for kinds we never parsed.
            Envelope::Unknown { kind } => serde_json::to_string(&serde_json::json!({ "type": kind }))
                .map_err(|e| ProtocolError::SerializationError(e.to_string())),
            _ => serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string())),
        }
    }

    /// Deserialize from raw frame bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::decode_str(text)
    }

    /// Deserialize from a text frame.
    ///
    /// Fails on malformed JSON, non-object payloads, a missing or non-string
    /// `type`, or a known `type` whose fields break its contract. Unknown
    /// tags succeed as [`Envelope::Unknown`].
    pub fn decode_str(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        if !value.is_object() {
            return Err(ProtocolError::Malformed("expected a JSON object".into()));
        }

        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_owned(),
            None => return Err(ProtocolError::MissingType),
        };

        if !KNOWN_KINDS.contains(&kind.as_str()) {
            return Ok(Envelope::Unknown { kind });
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidEnvelope {
            kind,
            reason: e.to_string(),
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Frame bytes are not UTF-8.
    InvalidUtf8,
    /// Frame is not a well-formed JSON object.
    Malformed(String),
    /// Object has no string `type` discriminator.
    MissingType,
    /// Known `type` with fields that do not match its contract.
    InvalidEnvelope { kind: String, reason: String },
    SerializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUtf8 => write!(f, "Frame is not valid UTF-8"),
            Self::Malformed(e) => write!(f, "Malformed frame: {e}"),
            Self::MissingType => write!(f, "Frame has no type discriminator"),
            Self::InvalidEnvelope { kind, reason } => {
                write!(f, "Invalid {kind} envelope: {reason}")
            }
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
