//! Client SDK for per-table game event streams.
//!
//! The crate turns a push transport that may reorder, duplicate, stall or
//! drop into a gap-free, causally ordered timeline delivered to one async
//! handler, and resumes from the last delivered sequence id after every
//! reconnect.
//!
//! - `stream`: sessions, ordering queue, dispatcher, connection manager and
//!   the SSE transport.
//! - `retry`: backoff and timeout utilities.

/// Reconnect backoff and timeout helpers.
pub mod retry;
/// Realtime table stream client, ordering queue, and session helpers.
pub mod stream;

pub use stream::client::{StreamClient, StreamClientError, StreamClientOptions};
pub use stream::connection::ConnectionState;
pub use stream::proto::{EventKind, SequenceId, StreamEvent};
pub use stream::queue::{handler_fn, EventHandler, FailurePolicy};
pub use stream::session::{LobbySession, SessionStatus, SubscribeOptions, TableSession};
