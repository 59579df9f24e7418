use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Server-assigned position of an event in a table's timeline.
///
/// `0` is reserved for events without ordering identity.
pub type SequenceId = u64;

/// Event kinds carried in the `kind` field of the stream envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    HandStart,
    PlayerAction,
    HandEnd,
    CommunityCards,
    Chat,
    /// Kind not known to this SDK version. Treated as ordered.
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::HandStart => "hand_start",
            Self::PlayerAction => "player_action",
            Self::HandEnd => "hand_end",
            Self::CommunityCards => "community_cards",
            Self::Chat => "chat",
            Self::Other(kind) => kind,
        }
    }

    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "hand_start" => Self::HandStart,
            "player_action" => Self::PlayerAction,
            "hand_end" => Self::HandEnd,
            "community_cards" => Self::CommunityCards,
            "chat" => Self::Chat,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let kind = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&kind))
    }
}

/// Set of kinds delivered out-of-band, without sequence ids or ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralKinds {
    kinds: HashSet<EventKind>,
}

impl EphemeralKinds {
    pub fn new(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }

    pub fn contains(&self, kind: &EventKind) -> bool {
        self.kinds.contains(kind)
    }
}

impl Default for EphemeralKinds {
    fn default() -> Self {
        Self::new([EventKind::Chat])
    }
}

/// JSON body of a stream message: `{"kind": ..., ...payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EventKind,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One message as delivered by the push transport, before parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    /// Transport id slot (SSE `id:` field), carrying the sequence id.
    pub id: Option<String>,
    /// Transport event name (SSE `event:` field), if any.
    pub event: Option<String>,
    /// Message body.
    pub data: String,
}

impl RawMessage {
    pub fn with_id(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            event: None,
            data: data.into(),
        }
    }

    pub fn without_id(data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: None,
            data: data.into(),
        }
    }
}

/// Parsed stream event handed to an [`EventHandler`](crate::stream::queue::EventHandler).
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub sequence_id: SequenceId,
    pub kind: EventKind,
    pub payload: Map<String, Value>,
}

impl StreamEvent {
    pub fn ordered(sequence_id: SequenceId, envelope: Envelope) -> Self {
        Self {
            sequence_id,
            kind: envelope.kind,
            payload: envelope.payload,
        }
    }

    pub fn ephemeral(envelope: Envelope) -> Self {
        Self::ordered(0, envelope)
    }

    pub fn has_ordering_identity(&self) -> bool {
        self.sequence_id > 0
    }

    /// Deserializes the kind-specific payload into a caller-defined type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            kind: self.kind.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Highest sequence id whose handler completed successfully.
///
/// Shared between the ordering queue (writer) and the connection manager
/// (reader, on every reconnect).
#[derive(Clone, Debug, Default)]
pub struct ResumeCursor {
    highest: Arc<AtomicU64>,
}

impl ResumeCursor {
    pub fn new(start: Option<SequenceId>) -> Self {
        Self {
            highest: Arc::new(AtomicU64::new(start.unwrap_or(0))),
        }
    }

    pub fn get(&self) -> Option<SequenceId> {
        match self.highest.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Raises the cursor to `sequence_id`; never moves it backwards.
    pub fn advance(&self, sequence_id: SequenceId) {
        self.highest.fetch_max(sequence_id, Ordering::AcqRel);
    }
}
