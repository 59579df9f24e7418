//! Consumer-facing sessions.
//!
//! A session wires transport, dispatcher, ordering queue and connection
//! manager together and exposes the live status a UI binds to. It is the
//! only piece host frameworks need to touch: create it on mount, toggle it
//! with [`TableSession::set_enabled`], drop it on unmount.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::stream::client::StreamClientOptions;
use crate::stream::connection::{ConnectionManager, ConnectionState};
use crate::stream::dispatch::Dispatcher;
use crate::stream::proto::{ResumeCursor, SequenceId};
use crate::stream::queue::{EventHandler, OrderingQueue, QueueConfig};
use crate::stream::transport::Transport;

/// Parameters of a table subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub table_id: String,
    /// Connect immediately when `true`.
    pub enabled: bool,
    /// Highest sequence id the caller has already applied, if any.
    pub last_event_id: Option<SequenceId>,
}

impl SubscribeOptions {
    pub fn new(table_id: impl Into<String>) -> Self {
        Self {
            table_id: table_id.into(),
            enabled: true,
            last_event_id: None,
        }
    }

    pub fn with_last_event_id(mut self, last_event_id: SequenceId) -> Self {
        self.last_event_id = Some(last_event_id);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Point-in-time view of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub last_processed_event_id: SequenceId,
    pub queue_size: usize,
    pub is_processing: bool,
}

#[derive(Debug)]
struct Pipeline {
    queue: OrderingQueue,
    connection: ConnectionManager,
}

impl Pipeline {
    fn new(
        transport: Arc<dyn Transport>,
        handler: Arc<dyn EventHandler>,
        last_event_id: Option<SequenceId>,
        client_options: &StreamClientOptions,
    ) -> Self {
        let cursor = ResumeCursor::new(last_event_id);
        let queue = OrderingQueue::new(
            handler,
            QueueConfig {
                last_processed_id: last_event_id,
                ephemeral_kinds: client_options.ephemeral_kinds.clone(),
                failure_policy: client_options.failure_policy,
                cursor: cursor.clone(),
            },
        );
        let dispatcher = Dispatcher::new(queue.clone());
        let connection = ConnectionManager::new(
            transport,
            Arc::new(dispatcher),
            cursor,
            client_options.connection_options(),
        );
        watch_for_halt(&queue, &connection);
        Self { queue, connection }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            connection_state: self.connection.state(),
            last_processed_event_id: self.queue.last_processed_id(),
            queue_size: self.queue.len(),
            is_processing: self.queue.is_processing(),
        }
    }

    fn set_enabled(&self, enabled: bool) {
        if !enabled {
            self.connection.close();
            return;
        }
        if self.connection.is_open() || self.queue.is_stopped() {
            return;
        }
        self.connection.open();
    }

    fn shutdown(&self) {
        self.connection.close();
        self.queue.stop();
    }
}

/// Closes the transport once the queue halts; nothing more can be delivered.
fn watch_for_halt(queue: &OrderingQueue, connection: &ConnectionManager) {
    let mut halted = queue.watch_halt();
    let closer = connection.closer();
    tokio::spawn(async move {
        while halted.changed().await.is_ok() {
            let halted_at = *halted.borrow_and_update();
            if let Some(sequence_id) = halted_at {
                warn!(event = "session_halted", sequence_id);
                closer.close();
                return;
            }
        }
    });
}

/// Live subscription to one table's ordered event stream.
#[derive(Debug)]
pub struct TableSession {
    table_id: String,
    pipeline: Pipeline,
}

impl TableSession {
    /// Builds a session over any [`Transport`].
    ///
    /// [`StreamClient::subscribe_table`](crate::stream::client::StreamClient::subscribe_table)
    /// is the usual entry point; this constructor exists for custom
    /// transports. Must be called from within a Tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        options: SubscribeOptions,
        handler: Arc<dyn EventHandler>,
        client_options: &StreamClientOptions,
    ) -> Self {
        let pipeline = Pipeline::new(transport, handler, options.last_event_id, client_options);
        info!(
            event = "table_session_started",
            table_id = %options.table_id,
            enabled = options.enabled,
            last_event_id = options.last_event_id.unwrap_or(0)
        );
        if options.enabled {
            pipeline.connection.open();
        }
        Self {
            table_id: options.table_id,
            pipeline,
        }
    }

    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    pub fn status(&self) -> SessionStatus {
        self.pipeline.status()
    }

    /// Connects (immediately, from the current cursor) or disconnects.
    ///
    /// Disabling keeps buffered events and the processed high-water mark;
    /// re-enabling resumes from where delivery stopped. A halted session
    /// stays disconnected.
    pub fn set_enabled(&self, enabled: bool) {
        self.pipeline.set_enabled(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.pipeline.connection.is_open()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.pipeline.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.pipeline.connection.watch_state()
    }

    /// Highest sequence id delivered successfully; sent on reconnect.
    pub fn resume_cursor(&self) -> Option<SequenceId> {
        self.pipeline.connection.cursor().get()
    }

    /// Sequence id that halted the queue under `FailurePolicy::Halt`. The
    /// transport is closed when this becomes `Some`.
    pub fn halted_at(&self) -> Option<SequenceId> {
        self.pipeline.queue.halted_at()
    }

    /// Disconnects and discards buffered events. Irreversible.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for TableSession {
    fn drop(&mut self) {
        self.pipeline.shutdown();
        info!(event = "table_session_closed", table_id = %self.table_id);
    }
}

/// Live subscription to the lobby chat feed.
///
/// The feed carries only ephemeral kinds; it is never resumed from a cursor.
#[derive(Debug)]
pub struct LobbySession {
    pipeline: Pipeline,
}

impl LobbySession {
    /// Builds and connects a lobby session. Must be called from within a
    /// Tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        handler: Arc<dyn EventHandler>,
        client_options: &StreamClientOptions,
    ) -> Self {
        let pipeline = Pipeline::new(transport, handler, None, client_options);
        pipeline.connection.open();
        Self { pipeline }
    }

    pub fn status(&self) -> SessionStatus {
        self.pipeline.status()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.pipeline.set_enabled(enabled);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.pipeline.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.pipeline.connection.watch_state()
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for LobbySession {
    fn drop(&mut self) {
        self.pipeline.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::stream::{self, StreamExt};

    use super::{SubscribeOptions, TableSession};
    use crate::stream::client::StreamClientOptions;
    use crate::stream::connection::ConnectionState;
    use crate::stream::proto::{RawMessage, SequenceId, StreamEvent};
    use crate::stream::queue::{handler_fn, FailurePolicy};
    use crate::stream::transport::{MessageStream, Transport, TransportError};

    /// Replays a fixed backlog after the cursor and then holds the stream open.
    struct BacklogTransport {
        backlog: Vec<RawMessage>,
        cursors: Mutex<Vec<Option<SequenceId>>>,
    }

    #[async_trait]
    impl Transport for BacklogTransport {
        async fn subscribe(
            &self,
            cursor: Option<SequenceId>,
        ) -> Result<MessageStream, TransportError> {
            self.cursors.lock().expect("cursors").push(cursor);
            let after = cursor.unwrap_or(0);
            let replay: Vec<_> = self
                .backlog
                .iter()
                .filter(|raw| {
                    raw.id
                        .as_deref()
                        .and_then(|id| id.parse::<u64>().ok())
                        .map_or(true, |id| id > after)
                })
                .cloned()
                .map(Ok)
                .collect();
            Ok(stream::iter(replay).chain(stream::pending()).boxed())
        }
    }

    fn backlog() -> Vec<RawMessage> {
        vec![
            RawMessage::with_id("3", r#"{"kind":"community_cards","cards":["Ah","Kd","2c"]}"#),
            RawMessage::with_id("1", r#"{"kind":"hand_start","hand":1}"#),
            RawMessage::without_id(r#"{"kind":"chat","text":"nh"}"#),
            RawMessage::with_id("2", r#"{"kind":"player_action","action":"call"}"#),
            RawMessage::with_id("2", r#"{"kind":"player_action","action":"call"}"#),
        ]
    }

    fn recording() -> (Arc<Mutex<Vec<SequenceId>>>, impl crate::stream::queue::EventHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = Arc::clone(&seen);
            handler_fn(move |event: StreamEvent| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().expect("seen").push(event.sequence_id);
                    anyhow::Ok(())
                }
            })
        };
        (seen, handler)
    }

    #[tokio::test]
    async fn session_delivers_a_gap_free_timeline() {
        let transport = Arc::new(BacklogTransport {
            backlog: backlog(),
            cursors: Mutex::default(),
        });
        let (seen, handler) = recording();
        let session = TableSession::start(
            transport,
            SubscribeOptions::new("t1"),
            Arc::new(handler),
            &StreamClientOptions::default(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut ordered: Vec<_> = seen.lock().expect("seen").clone();
        ordered.retain(|id| *id > 0);
        assert_eq!(ordered, vec![1, 2, 3]);
        let status = session.status();
        assert_eq!(status.connection_state, ConnectionState::Connected);
        assert_eq!(status.last_processed_event_id, 3);
        assert_eq!(status.queue_size, 0);
        assert!(!status.is_processing);
        assert_eq!(session.resume_cursor(), Some(3));
    }

    #[tokio::test]
    async fn last_event_id_skips_already_applied_events() {
        let transport = Arc::new(BacklogTransport {
            backlog: backlog(),
            cursors: Mutex::default(),
        });
        let (seen, handler) = recording();
        let shared: Arc<dyn Transport> = transport.clone();
        let _session = TableSession::start(
            shared,
            SubscribeOptions::new("t1").with_last_event_id(2),
            Arc::new(handler),
            &StreamClientOptions::default(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;

        let ordered: Vec<_> = seen
            .lock()
            .expect("seen")
            .iter()
            .copied()
            .filter(|id| *id > 0)
            .collect();
        assert_eq!(ordered, vec![3]);
        assert_eq!(*transport.cursors.lock().expect("cursors"), vec![Some(2)]);
    }

    #[tokio::test]
    async fn disabled_session_stays_disconnected_until_enabled() {
        let transport = Arc::new(BacklogTransport {
            backlog: backlog(),
            cursors: Mutex::default(),
        });
        let (seen, handler) = recording();
        let shared: Arc<dyn Transport> = transport.clone();
        let session = TableSession::start(
            shared,
            SubscribeOptions::new("t1").with_enabled(false),
            Arc::new(handler),
            &StreamClientOptions::default(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(seen.lock().expect("seen").is_empty());

        session.set_enabled(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.connection_state(), ConnectionState::Connected);

        session.set_enabled(false);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(!session.is_enabled());

        session.set_enabled(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            *transport.cursors.lock().expect("cursors"),
            vec![None, Some(3)]
        );
    }

    #[tokio::test]
    async fn halted_session_closes_its_transport() {
        let transport = Arc::new(BacklogTransport {
            backlog: backlog(),
            cursors: Mutex::default(),
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = Arc::clone(&seen);
            handler_fn(move |event: StreamEvent| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().expect("seen").push(event.sequence_id);
                    if event.sequence_id == 2 {
                        anyhow::bail!("pot does not add up");
                    }
                    anyhow::Ok(())
                }
            })
        };
        let shared: Arc<dyn Transport> = transport.clone();
        let session = TableSession::start(
            shared,
            SubscribeOptions::new("t1"),
            Arc::new(handler),
            &StreamClientOptions {
                failure_policy: FailurePolicy::Halt,
                ..StreamClientOptions::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(session.halted_at(), Some(2));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(!session.is_enabled());
        assert_eq!(session.resume_cursor(), Some(1));
        assert!(!seen.lock().expect("seen").contains(&3));

        session.set_enabled(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(transport.cursors.lock().expect("cursors").len(), 1);
    }
}
