//! In-process broker with NSQ's topic and channel semantics.
//!
//! Each delivery group on a topic receives every published message. Within
//! a group, consumers take turns.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use relay_core::{PublishError, Publisher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::error::BrokerError;
use crate::subscriber::{Consumer, MessageHandler, Subscriber};

type GroupKey = (String, String);

#[derive(Default)]
struct Group {
    members: Vec<(u64, Arc<dyn MessageHandler>)>,
    cursor: usize,
}

impl Group {
    fn next(&mut self) -> Option<Arc<dyn MessageHandler>> {
        if self.members.is_empty() {
            return None;
        }
        let index = self.cursor % self.members.len();
        self.cursor = self.cursor.wrapping_add(1);
        Some(Arc::clone(&self.members[index].1))
    }
}

#[derive(Default)]
struct Inner {
    groups: DashMap<GroupKey, Group>,
    next_member: AtomicU64,
}

/// In-process broker.
///
/// Cheap to clone; clones share topics and groups.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publisher bound to `topic`.
    #[must_use]
    pub fn publisher(&self, topic: impl Into<String>) -> MemoryPublisher {
        MemoryPublisher {
            broker: self.clone(),
            topic: topic.into(),
        }
    }

    /// Hand `payload` to one member of every group on `topic`.
    pub fn publish_to(&self, topic: &str, payload: &[u8]) -> usize {
        let handlers: Vec<_> = self
            .inner
            .groups
            .iter_mut()
            .filter(|entry| entry.key().0 == topic)
            .filter_map(|mut entry| entry.value_mut().next())
            .collect();

        trace!(topic = %topic, groups = handlers.len(), "Memory publish");
        for handler in &handlers {
            handler.handle(payload);
        }
        handlers.len()
    }

    /// Number of consumers in a group.
    #[must_use]
    pub fn member_count(&self, topic: &str, group: &str) -> usize {
        self.inner
            .groups
            .get(&(topic.to_string(), group.to_string()))
            .map_or(0, |g| g.members.len())
    }

    fn remove(&self, key: &GroupKey, member: u64) {
        self.inner.groups.remove_if_mut(key, |_, group| {
            group.members.retain(|(id, _)| *id != member);
            group.members.is_empty()
        });
    }
}

/// Publishes to one topic of a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryPublisher {
    broker: MemoryBroker,
    topic: String,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        self.broker.publish_to(&self.topic, &payload);
        Ok(())
    }
}

#[async_trait]
impl Subscriber for MemoryBroker {
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn Consumer>, BrokerError> {
        if topic.is_empty() || group.is_empty() {
            return Err(BrokerError::Config("topic and group must not be empty".into()));
        }
        let key = (topic.to_string(), group.to_string());
        let member = self.inner.next_member.fetch_add(1, Ordering::Relaxed);
        self.inner
            .groups
            .entry(key.clone())
            .or_default()
            .members
            .push((member, handler));

        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            key,
            member,
            running: AtomicBool::new(true),
        }))
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    key: GroupKey,
    member: u64,
    running: AtomicBool,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn stop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.broker.remove(&self.key, self.member);
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.broker.remove(&self.key, self.member);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Vec<u8>>>);

    impl MessageHandler for Collect {
        fn handle(&self, payload: &[u8]) {
            self.0.lock().unwrap().push(payload.to_vec());
        }
    }

    impl Collect {
        fn count(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    #[tokio::test]
    async fn test_every_group_receives() {
        let broker = MemoryBroker::new();
        let a = Arc::new(Collect::default());
        let b = Arc::new(Collect::default());
        let _ca = broker.subscribe("Chat", "host-a", a.clone()).await.unwrap();
        let _cb = broker.subscribe("Chat", "host-b", b.clone()).await.unwrap();

        broker
            .publisher("Chat")
            .publish(Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
    }

    #[tokio::test]
    async fn test_group_members_take_turns() {
        let broker = MemoryBroker::new();
        let first = Arc::new(Collect::default());
        let second = Arc::new(Collect::default());
        let _c1 = broker.subscribe("Chat", "host-a", first.clone()).await.unwrap();
        let _c2 = broker.subscribe("Chat", "host-a", second.clone()).await.unwrap();

        for _ in 0..4 {
            assert_eq!(broker.publish_to("Chat", b"x"), 1);
        }

        assert_eq!(first.count(), 2);
        assert_eq!(second.count(), 2);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let broker = MemoryBroker::new();
        let handler = Arc::new(Collect::default());
        let _c = broker.subscribe("Chat", "host-a", handler.clone()).await.unwrap();

        assert_eq!(broker.publish_to("Other", b"x"), 0);
        assert_eq!(handler.count(), 0);
    }

    #[tokio::test]
    async fn test_stop_and_drop_unsubscribe() {
        let broker = MemoryBroker::new();
        let mut stopped = broker
            .subscribe("Chat", "host-a", Arc::new(Collect::default()))
            .await
            .unwrap();
        let dropped = broker
            .subscribe("Chat", "host-a", Arc::new(Collect::default()))
            .await
            .unwrap();
        assert_eq!(broker.member_count("Chat", "host-a"), 2);

        stopped.stop().await;
        assert!(!stopped.is_running());
        assert_eq!(broker.member_count("Chat", "host-a"), 1);

        drop(dropped);
        assert_eq!(broker.member_count("Chat", "host-a"), 0);
        assert_eq!(broker.publish_to("Chat", b"x"), 0);
    }
}
