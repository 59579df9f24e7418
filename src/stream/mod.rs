//! Table event stream modules.
//!
//! - `proto`: envelope, event kinds, and the resume cursor.
//! - `sse`: incremental Server-Sent Events decoder.
//! - `transport`: subscription trait and the HTTP SSE transport.
//! - `queue`: ordering/de-duplication queue and the handler contract.
//! - `dispatch`: parses raw messages and routes them by kind.
//! - `connection`: reconnecting subscription state machine.
//! - `session`: consumer-facing table and lobby sessions.
//! - `client`: endpoint configuration and session construction.

/// Endpoint configuration and session entry points.
pub mod client;
/// Reconnect state machine.
pub mod connection;
/// Kind-based message routing.
pub mod dispatch;
/// Stream protocol types.
pub mod proto;
/// Ordered delivery queue.
pub mod queue;
/// Table and lobby sessions.
pub mod session;
/// Server-Sent Events framing.
pub mod sse;
/// Push transports.
pub mod transport;
