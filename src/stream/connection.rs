//! Reconnecting subscription manager.
//!
//! A [`ConnectionManager`] owns at most one background worker. The worker
//! subscribes through a [`Transport`], forwards every message to a
//! [`MessageSink`], and on failure waits out an exponential backoff before
//! resubscribing from the current [`ResumeCursor`].
//!
//! Every worker is stamped with a generation. State changes and message
//! delivery happen under the manager's lock and only while the worker's
//! generation is current, so a worker that outlives `close()` is inert.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::retry::{with_timeout, Backoff, BackoffPolicy};
use crate::stream::proto::{RawMessage, ResumeCursor};
use crate::stream::transport::{Transport, TransportError};

/// Subscription lifecycle as observed by callers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Receiver of raw messages from a live subscription.
///
/// Called synchronously from the connection worker; must not block.
pub trait MessageSink: Send + Sync + 'static {
    fn deliver(&self, message: RawMessage);
}

/// Reconnect timing for a [`ConnectionManager`].
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub backoff: BackoffPolicy,
    /// Upper bound on how long a subscribe call may take to open.
    pub connect_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::reconnect(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct Inner {
    generation: u64,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(event = "connection_state_changed", from = ?previous, to = ?state);
        }
    }

    fn close(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        if let Some(worker) = inner.worker.take() {
            worker.abort();
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Closes a [`ConnectionManager`] from another task without owning it.
///
/// Does nothing once the manager has been dropped.
#[derive(Clone, Debug)]
pub struct ConnectionCloser {
    shared: Weak<Shared>,
}

impl ConnectionCloser {
    pub fn close(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.close();
        }
    }
}

/// Owns the subscription and its reconnect loop.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn MessageSink>,
    cursor: ResumeCursor,
    options: ConnectionOptions,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("cursor", &self.cursor.get())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn MessageSink>,
        cursor: ResumeCursor,
        options: ConnectionOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    generation: 0,
                    worker: None,
                }),
                state_tx,
            }),
            transport,
            sink,
            cursor,
            options,
        }
    }

    /// Starts a fresh subscription, replacing any existing worker.
    ///
    /// Spawns the worker task; must be called from within a Tokio runtime.
    pub fn open(&self) {
        let mut inner = self.shared.lock();
        if let Some(worker) = inner.worker.take() {
            worker.abort();
        }
        inner.generation += 1;
        let generation = inner.generation;
        self.shared.set_state(ConnectionState::Connecting);

        let worker = Worker {
            shared: Arc::clone(&self.shared),
            transport: Arc::clone(&self.transport),
            sink: Arc::clone(&self.sink),
            cursor: self.cursor.clone(),
            options: self.options.clone(),
            generation,
        };
        inner.worker = Some(tokio::spawn(worker.run()));
    }

    /// Closes the subscription and cancels any pending reconnect.
    ///
    /// Safe to call in every state; the manager is `Disconnected` on return
    /// and no message from the closed worker reaches the sink afterwards.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn closer(&self) -> ConnectionCloser {
        ConnectionCloser {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Whether a worker is attached (subscribed, connecting, or backing off).
    pub fn is_open(&self) -> bool {
        self.shared.lock().worker.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn cursor(&self) -> &ResumeCursor {
        &self.cursor
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

struct Worker {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn MessageSink>,
    cursor: ResumeCursor,
    options: ConnectionOptions,
    generation: u64,
}

impl Worker {
    async fn run(self) {
        let mut backoff = Backoff::new(self.options.backoff.clone());

        loop {
            if !self.transition(ConnectionState::Connecting) {
                return;
            }

            let cursor = self.cursor.get();
            debug!(event = "stream_subscribing", cursor = cursor.unwrap_or(0));
            let failure = match with_timeout(
                self.options.connect_timeout,
                self.transport.subscribe(cursor),
            )
            .await
            {
                Err(_) => TransportError::Timeout(self.options.connect_timeout),
                Ok(Err(err)) => err,
                Ok(Ok(mut messages)) => loop {
                    match messages.next().await {
                        Some(Ok(message)) => {
                            if !self.deliver(message, &mut backoff) {
                                return;
                            }
                        }
                        Some(Err(err)) => break err,
                        None => break TransportError::Closed,
                    }
                },
            };

            if !self.transition(ConnectionState::Error) {
                return;
            }
            let delay = backoff.next_delay();
            warn!(
                event = "reconnect_scheduled",
                error = %failure,
                delay_ms = delay.as_millis() as u64
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn transition(&self, state: ConnectionState) -> bool {
        let inner = self.shared.lock();
        if inner.generation != self.generation {
            return false;
        }
        self.shared.set_state(state);
        true
    }

    fn deliver(&self, message: RawMessage, backoff: &mut Backoff) -> bool {
        let inner = self.shared.lock();
        if inner.generation != self.generation {
            return false;
        }
        if *self.shared.state_tx.borrow() != ConnectionState::Connected {
            backoff.reset();
            self.shared.set_state(ConnectionState::Connected);
        }
        self.sink.deliver(message);
        drop(inner);
        true
    }
}
