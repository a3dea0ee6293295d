//! The per-process client hub.
//!
//! A [`Hub`] is a cheap, cloneable handle onto a control loop that owns the
//! membership set. Callers only enqueue requests: `join`, `leave` and
//! `deliver` each feed their own unbounded queue and return immediately.
//! The control loop handles one request at a time, so membership changes
//! and fan-out never interleave and no lock guards the set.
//!
//! Fan-out only enqueues onto clients whose channel matches the message.
//! A client whose bounded outbound queue is full is disconnected rather
//! than awaited, so one slow socket cannot stall delivery to everyone else.

use crate::client::{ClientHandle, ClientId};
use relay_protocol::Message;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

static NEXT_HUB_ID: AtomicU64 = AtomicU64::new(1);

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The control loop has stopped.
    #[error("Hub is shut down")]
    Closed,
}

/// Process-unique hub identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HubId(u64);

impl fmt::Display for HubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hub-{}", self.0)
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    /// Number of registered clients.
    pub client_count: usize,
    /// Messages enqueued onto client queues.
    pub delivered: u64,
    /// Clients disconnected because their queue was full.
    pub slow_clients_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    clients: AtomicUsize,
    delivered: AtomicU64,
    slow_dropped: AtomicU64,
}

struct Shared {
    id: HubId,
    join_tx: mpsc::UnboundedSender<ClientHandle>,
    leave_tx: mpsc::UnboundedSender<ClientId>,
    deliver_tx: mpsc::UnboundedSender<Arc<Message>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

/// Handle to a running hub.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub").field("id", &self.shared.id).finish()
    }
}

impl Hub {
    /// Spawn a hub control loop on the current runtime.
    #[must_use]
    pub fn start() -> Self {
        let (join_tx, join_rx) = mpsc::unbounded_channel();
        let (leave_tx, leave_rx) = mpsc::unbounded_channel();
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let counters = Arc::new(Counters::default());
        let id = HubId(NEXT_HUB_ID.fetch_add(1, Ordering::Relaxed));

        let control = ControlLoop {
            id,
            members: HashMap::new(),
            counters: Arc::clone(&counters),
        };
        let task = tokio::spawn(control.run(join_rx, leave_rx, deliver_rx, shutdown_rx));

        info!(hub = %id, "Hub started");

        Self {
            shared: Arc::new(Shared {
                id,
                join_tx,
                leave_tx,
                deliver_tx,
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                task: Mutex::new(Some(task)),
                counters,
            }),
        }
    }

    /// Hub id.
    #[must_use]
    pub fn id(&self) -> HubId {
        self.shared.id
    }

    /// Register a client.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has shut down.
    pub fn join(&self, client: ClientHandle) -> Result<(), HubError> {
        self.shared.join_tx.send(client).map_err(|_| HubError::Closed)
    }

    /// Unregister a client. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has shut down.
    pub fn leave(&self, id: ClientId) -> Result<(), HubError> {
        self.shared.leave_tx.send(id).map_err(|_| HubError::Closed)
    }

    /// Fan a message out to every client on its channel.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has shut down.
    pub fn deliver(&self, message: impl Into<Arc<Message>>) -> Result<(), HubError> {
        self.shared
            .deliver_tx
            .send(message.into())
            .map_err(|_| HubError::Closed)
    }

    /// Whether the control loop is still accepting requests.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shared.deliver_tx.is_closed()
    }

    /// Number of currently registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.counters.clients.load(Ordering::Relaxed)
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let counters = &self.shared.counters;
        HubStats {
            client_count: counters.clients.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            slow_clients_dropped: counters.slow_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the control loop and wait for it to exit.
    ///
    /// Every client's outbound queue is closed, so each connection sends a
    /// close frame and tears down. Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        let signal = self
            .shared
            .shutdown_tx
            .lock()
            .ok()
            .and_then(|mut tx| tx.take());
        if let Some(tx) = signal {
            let _ = tx.send(());
        }

        let task = self.shared.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(hub = %self.shared.id, error = %e, "Hub control loop panicked");
            }
        }
    }
}

struct ControlLoop {
    id: HubId,
    members: HashMap<ClientId, ClientHandle>,
    counters: Arc<Counters>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut join_rx: mpsc::UnboundedReceiver<ClientHandle>,
        mut leave_rx: mpsc::UnboundedReceiver<ClientId>,
        mut deliver_rx: mpsc::UnboundedReceiver<Arc<Message>>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => break,

                Some(client) = join_rx.recv() => self.join(client),

                Some(id) = leave_rx.recv() => self.leave(id),

                Some(message) = deliver_rx.recv() => self.broadcast(&message),

                else => break,
            }
        }

        // Dropping the members drops every outbound sender.
        let remaining = self.members.len();
        self.members.clear();
        self.counters.clients.store(0, Ordering::Relaxed);
        info!(hub = %self.id, clients = remaining, "Hub stopped");
    }

    fn join(&mut self, client: ClientHandle) {
        let id = client.id();
        debug!(
            hub = %self.id,
            client = %id,
            channel = %client.channel(),
            user = %client.user().id,
            "Client joined"
        );
        self.members.insert(id, client);
        self.update_count();
    }

    fn leave(&mut self, id: ClientId) {
        if self.members.remove(&id).is_some() {
            debug!(hub = %self.id, client = %id, "Client left");
            self.update_count();
        } else {
            trace!(hub = %self.id, client = %id, "Leave for unknown client");
        }
    }

    fn broadcast(&mut self, message: &Arc<Message>) {
        let mut evicted = Vec::new();
        let mut recipients = 0u64;

        for (id, client) in &self.members {
            if client.channel() != message.channel {
                continue;
            }
            match client.outbound().try_send(Arc::clone(message)) {
                Ok(()) => recipients += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(hub = %self.id, client = %id, "Outbound queue full, disconnecting slow client");
                    self.counters.slow_dropped.fetch_add(1, Ordering::Relaxed);
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => evicted.push(*id),
            }
        }

        for id in evicted {
            self.members.remove(&id);
        }
        self.update_count();
        self.counters
            .delivered
            .fetch_add(recipients, Ordering::Relaxed);

        trace!(
            hub = %self.id,
            channel = %message.channel,
            recipients,
            "Broadcast message"
        );
    }

    fn update_count(&self) {
        self.counters
            .clients
            .store(self.members.len(), Ordering::Relaxed);
    }
}
