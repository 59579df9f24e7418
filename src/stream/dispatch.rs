//! Kind-based routing of raw transport messages.

use thiserror::Error;
use tracing::warn;

use crate::stream::connection::MessageSink;
use crate::stream::proto::{Envelope, EphemeralKinds, EventKind, RawMessage, SequenceId, StreamEvent};
use crate::stream::queue::OrderingQueue;

/// Reasons a raw message is dropped before reaching the queue.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Body is not a JSON object with a `kind` field.
    #[error("invalid envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// Ordered kind without a positive integer id.
    #[error("{kind} event without a valid sequence id (id: {id:?})")]
    MissingSequenceId { kind: EventKind, id: Option<String> },
}

/// Parses raw messages and feeds them to an [`OrderingQueue`].
#[derive(Clone, Debug)]
pub struct Dispatcher {
    queue: OrderingQueue,
}

impl Dispatcher {
    pub fn new(queue: OrderingQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &OrderingQueue {
        &self.queue
    }

    /// Parses one message into a [`StreamEvent`].
    ///
    /// Ephemeral kinds get sequence id `0` whatever the transport id says.
    pub fn parse(&self, raw: &RawMessage) -> Result<StreamEvent, DispatchError> {
        parse_message(raw, self.queue.ephemeral_kinds())
    }

    /// Parses and enqueues one message. Malformed messages are logged and
    /// dropped; returns whether the message was forwarded.
    pub fn dispatch(&self, raw: RawMessage) -> bool {
        match self.parse(&raw) {
            Ok(event) => {
                self.queue.enqueue(event);
                true
            }
            Err(err) => {
                warn!(
                    event = "message_malformed",
                    id = raw.id.as_deref().unwrap_or(""),
                    error = %err
                );
                false
            }
        }
    }
}

impl MessageSink for Dispatcher {
    fn deliver(&self, message: RawMessage) {
        self.dispatch(message);
    }
}

pub fn parse_message(
    raw: &RawMessage,
    ephemeral_kinds: &EphemeralKinds,
) -> Result<StreamEvent, DispatchError> {
    let envelope = Envelope::from_text(&raw.data)?;

    if ephemeral_kinds.contains(&envelope.kind) {
        return Ok(StreamEvent::ephemeral(envelope));
    }

    match raw.id.as_deref().and_then(parse_sequence_id) {
        Some(sequence_id) => Ok(StreamEvent::ordered(sequence_id, envelope)),
        None => Err(DispatchError::MissingSequenceId {
            kind: envelope.kind,
            id: raw.id.clone(),
        }),
    }
}

fn parse_sequence_id(id: &str) -> Option<SequenceId> {
    id.trim().parse::<SequenceId>().ok().filter(|id| *id > 0)
}
