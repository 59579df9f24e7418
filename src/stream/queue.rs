//! Ordering and de-duplication queue.
//!
//! Events may be enqueued in any order; the queue releases ordered events to
//! the handler strictly by increasing sequence id, one at a time, from a
//! single drain task. Ephemeral kinds skip the buffer and go through their
//! own FIFO lane, so they keep arrival order without waiting on the backlog.
//!
//! `enqueue` spawns tasks and must be called from within a Tokio runtime.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::stream::proto::{EphemeralKinds, ResumeCursor, SequenceId, StreamEvent};

/// Consumer callback for stream events.
///
/// The returned future must complete before the next ordered event is
/// released; a slow handler paces the stream.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: StreamEvent) -> anyhow::Result<()>;
}

/// [`EventHandler`] backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(StreamEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(StreamEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: StreamEvent) -> anyhow::Result<()> {
        (self.f)(event).await
    }
}

/// What the queue does after a handler returns an error or panics.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FailurePolicy {
    /// Mark the event processed and continue with the next one.
    #[default]
    Advance,
    /// Mark the event processed, then stop the queue and record its id.
    Halt,
}

/// Construction parameters for [`OrderingQueue`].
#[derive(Clone, Debug, Default)]
pub struct QueueConfig {
    /// Events at or below this id are treated as already processed.
    pub last_processed_id: Option<SequenceId>,
    pub ephemeral_kinds: EphemeralKinds,
    pub failure_policy: FailurePolicy,
    /// Cursor advanced after each successful ordered delivery.
    pub cursor: ResumeCursor,
}

#[derive(Debug, Default)]
struct QueueState {
    buffer: VecDeque<StreamEvent>,
    last_processed_id: SequenceId,
    in_flight: Option<SequenceId>,
    draining: bool,
    stopped: bool,
    halted_at: Option<SequenceId>,
    ephemeral_lane: Option<mpsc::UnboundedSender<StreamEvent>>,
}

struct Shared {
    state: Mutex<QueueState>,
    handler: Arc<dyn EventHandler>,
    ephemeral_kinds: EphemeralKinds,
    failure_policy: FailurePolicy,
    cursor: ResumeCursor,
    halt_tx: watch::Sender<Option<SequenceId>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle to one ordering queue.
#[derive(Clone)]
pub struct OrderingQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for OrderingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("OrderingQueue")
            .field("len", &state.buffer.len())
            .field("last_processed_id", &state.last_processed_id)
            .field("draining", &state.draining)
            .field("stopped", &state.stopped)
            .finish()
    }
}

impl OrderingQueue {
    pub fn new(handler: Arc<dyn EventHandler>, config: QueueConfig) -> Self {
        let state = QueueState {
            last_processed_id: config.last_processed_id.unwrap_or(0),
            ..QueueState::default()
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                handler,
                ephemeral_kinds: config.ephemeral_kinds,
                failure_policy: config.failure_policy,
                cursor: config.cursor,
                halt_tx: watch::channel(None).0,
            }),
        }
    }

    /// Creates a fresh queue with default configuration.
    pub fn with_handler(handler: impl EventHandler) -> Self {
        Self::new(Arc::new(handler), QueueConfig::default())
    }

    pub fn ephemeral_kinds(&self) -> &EphemeralKinds {
        &self.shared.ephemeral_kinds
    }

    pub fn cursor(&self) -> &ResumeCursor {
        &self.shared.cursor
    }

    /// Accepts an event in any arrival order.
    ///
    /// Ephemeral kinds are handed to the ephemeral lane, which calls the
    /// handler in arrival order independently of the buffer. Ordered events at or below the processed high-water mark, or
    /// already buffered, are dropped.
    pub fn enqueue(&self, event: StreamEvent) {
        let mut state = self.shared.lock();
        if state.stopped {
            return;
        }

        if self.shared.ephemeral_kinds.contains(&event.kind) {
            let lane = state
                .ephemeral_lane
                .get_or_insert_with(|| spawn_ephemeral_lane(&self.shared));
            if lane.send(event).is_err() {
                debug!(event = "ephemeral_lane_closed");
            }
            return;
        }

        let sequence_id = event.sequence_id;
        if sequence_id <= state.last_processed_id || state.in_flight == Some(sequence_id) {
            debug!(
                event = "event_stale_dropped",
                sequence_id,
                last_processed_id = state.last_processed_id
            );
            return;
        }

        match state
            .buffer
            .binary_search_by_key(&sequence_id, |queued| queued.sequence_id)
        {
            Ok(_) => {
                debug!(event = "event_duplicate_dropped", sequence_id);
                return;
            }
            Err(position) => state.buffer.insert(position, event),
        }

        if !state.draining {
            state.draining = true;
            tokio::spawn(drain(Arc::clone(&self.shared)));
        }
    }

    /// Marks the queue terminal and drops everything buffered.
    ///
    /// Later `enqueue` calls are ignored. A handler already running is not
    /// interrupted.
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        state.stopped = true;
        state.buffer.clear();
        state.ephemeral_lane = None;
    }

    /// Alias of [`OrderingQueue::clear`].
    pub fn stop(&self) {
        self.clear();
    }

    /// Number of ordered events waiting in the buffer.
    pub fn len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the drain task is running.
    pub fn is_processing(&self) -> bool {
        self.shared.lock().draining
    }

    pub fn last_processed_id(&self) -> SequenceId {
        self.shared.lock().last_processed_id
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }

    /// Id of the failed event that halted the queue under [`FailurePolicy::Halt`].
    pub fn halted_at(&self) -> Option<SequenceId> {
        self.shared.lock().halted_at
    }

    /// Yields `Some(id)` once the queue halts under [`FailurePolicy::Halt`].
    pub fn watch_halt(&self) -> watch::Receiver<Option<SequenceId>> {
        self.shared.halt_tx.subscribe()
    }
}

/// Starts the task that delivers ephemeral events one at a time, in the
/// order they were enqueued. It ends when the queue is stopped or dropped.
fn spawn_ephemeral_lane(shared: &Arc<Shared>) -> mpsc::UnboundedSender<StreamEvent> {
    let (lane_tx, mut lane_rx) = mpsc::unbounded_channel::<StreamEvent>();
    let handler = Arc::clone(&shared.handler);
    let shared = Arc::downgrade(shared);
    tokio::spawn(async move {
        while let Some(event) = lane_rx.recv().await {
            let stopped = shared.upgrade().map_or(true, |shared| shared.lock().stopped);
            if stopped {
                return;
            }
            let kind = event.kind.clone();
            if let Err(err) = invoke(handler.as_ref(), event).await {
                warn!(event = "ephemeral_handler_failed", %kind, error = %err);
            }
        }
    });
    lane_tx
}

async fn drain(shared: Arc<Shared>) {
    loop {
        let event = {
            let mut state = shared.lock();
            let next = if state.stopped {
                None
            } else {
                state.buffer.pop_front()
            };
            match next {
                Some(event) => {
                    state.in_flight = Some(event.sequence_id);
                    event
                }
                None => {
                    state.draining = false;
                    return;
                }
            }
        };

        let sequence_id = event.sequence_id;
        let kind = event.kind.clone();
        let result = invoke(shared.handler.as_ref(), event).await;

        let mut state = shared.lock();
        state.in_flight = None;
        state.last_processed_id = state.last_processed_id.max(sequence_id);

        match result {
            Ok(()) => shared.cursor.advance(sequence_id),
            Err(err) => {
                warn!(event = "handler_failed", sequence_id, %kind, error = %err);
                if shared.failure_policy == FailurePolicy::Halt {
                    error!(event = "queue_halted", sequence_id, dropped = state.buffer.len());
                    state.halted_at = Some(sequence_id);
                    state.stopped = true;
                    state.buffer.clear();
                    state.ephemeral_lane = None;
                    shared.halt_tx.send_replace(Some(sequence_id));
                }
            }
        }
    }
}

/// Runs the handler, converting a panic into an error.
async fn invoke(handler: &dyn EventHandler, event: StreamEvent) -> anyhow::Result<()> {
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(anyhow::anyhow!("handler panicked: {message}"))
        }
    }
}
