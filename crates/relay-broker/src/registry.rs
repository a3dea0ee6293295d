//! Per-process subscription registry.
//!
//! Holds at most one consumer for the delivery group. Hubs attach to a shared
//! fanout; every message the consumer receives is decoded once and delivered
//! to each attached hub. Consumer setup runs outside the state lock, so health
//! checks and upgrades never wait on broker discovery.

use dashmap::DashMap;
use relay_core::{Hub, HubId};
use relay_protocol::{codec, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::group::local_delivery_group;
use crate::subscriber::{Consumer, MessageHandler, Subscriber};

/// Delivers broker payloads to every attached hub.
#[derive(Default)]
pub struct HubFanout {
    hubs: DashMap<HubId, Hub>,
}

impl HubFanout {
    pub fn attach(&self, hub: &Hub) -> bool {
        self.hubs.insert(hub.id(), hub.clone()).is_none()
    }

    #[must_use]
    pub fn hub_count(&self) -> usize {
        self.hubs.len()
    }
}

impl MessageHandler for HubFanout {
    fn handle(&self, payload: &[u8]) {
        let message: Arc<Message> = match codec::decode(payload) {
            Ok(m) => Arc::new(m),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable broker message");
                return;
            }
        };

        self.hubs.retain(|id, hub| match hub.deliver(Arc::clone(&message)) {
            Ok(()) => true,
            Err(_) => {
                debug!(hub = %id, "Detaching stopped hub");
                false
            }
        });
    }
}

/// Outcome of [`SubscriptionRegistry::ensure_subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    /// A consumer was created for this call.
    Created,
    /// The consumer already existed; the hub was attached to it.
    Existing,
    /// Another caller is creating the consumer. The hub is attached and
    /// receives once that setup completes.
    Pending,
}

/// Ensures one consumer for the delivery group and attaches hubs to it.
pub struct SubscriptionRegistry {
    subscriber: Arc<dyn Subscriber>,
    topic: String,
    group: String,
    fanout: Arc<HubFanout>,
    consumer: Mutex<Option<Box<dyn Consumer>>>,
    /// Held for the whole of one setup attempt, never while `consumer` is.
    setup: Mutex<()>,
    closed: AtomicBool,
}

impl SubscriptionRegistry {
    /// Registry for `topic` using this host's delivery group.
    pub fn new(subscriber: Arc<dyn Subscriber>, topic: impl Into<String>) -> Self {
        Self::with_group(subscriber, topic, local_delivery_group())
    }

    pub fn with_group(
        subscriber: Arc<dyn Subscriber>,
        topic: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            subscriber,
            topic: topic.into(),
            group: group.into(),
            fanout: Arc::new(HubFanout::default()),
            consumer: Mutex::new(None),
            setup: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Make sure this process consumes the topic and `hub` receives from it.
    ///
    /// The hub is attached before anything else, so it receives as soon as a
    /// consumer runs. Only one caller at a time creates the consumer; others
    /// return [`Ensured::Pending`] instead of waiting on broker discovery. A
    /// consumer that stopped on its own is replaced. A failed setup leaves
    /// nothing registered, so the next call retries.
    ///
    /// # Errors
    ///
    /// Returns the subscriber's error if the consumer could not be created,
    /// or [`BrokerError::Closed`] after [`shutdown`](Self::shutdown).
    pub async fn ensure_subscription(&self, hub: &Hub) -> Result<Ensured, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if self.fanout.attach(hub) {
            debug!(hub = %hub.id(), group = %self.group, "Hub attached to subscription");
        }
        if self.is_active().await {
            return Ok(Ensured::Existing);
        }

        let Ok(_setup) = self.setup.try_lock() else {
            debug!(group = %self.group, "Subscription setup already in progress");
            return Ok(Ensured::Pending);
        };

        let stale = {
            let mut slot = self.consumer.lock().await;
            if slot.as_ref().is_some_and(|c| c.is_running()) {
                return Ok(Ensured::Existing);
            }
            slot.take()
        };
        if let Some(mut stale) = stale {
            warn!(topic = %self.topic, group = %self.group, "Consumer stopped, resubscribing");
            stale.stop().await;
        }

        let handler: Arc<dyn MessageHandler> = Arc::clone(&self.fanout) as Arc<dyn MessageHandler>;
        let mut consumer = self
            .subscriber
            .subscribe(&self.topic, &self.group, handler)
            .await
            .map_err(|e| {
                warn!(topic = %self.topic, group = %self.group, error = %e, "Subscription setup failed");
                e
            })?;

        let mut slot = self.consumer.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            drop(slot);
            consumer.stop().await;
            return Err(BrokerError::Closed);
        }
        *slot = Some(consumer);
        info!(topic = %self.topic, group = %self.group, "Subscription established");
        Ok(Ensured::Created)
    }

    /// Whether a consumer is registered and running.
    pub async fn is_active(&self) -> bool {
        self.consumer
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| c.is_running())
    }

    /// Hubs attached to the fanout.
    #[must_use]
    pub fn hub_count(&self) -> usize {
        self.fanout.hub_count()
    }

    /// Stop the consumer. Later calls to
    /// [`ensure_subscription`](Self::ensure_subscription) fail.
    pub async fn shutdown(&self) {
        let consumer = {
            let mut slot = self.consumer.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            slot.take()
        };
        if let Some(mut consumer) = consumer {
            consumer.stop().await;
            info!(group = %self.group, "Subscription stopped");
        }
    }
}
