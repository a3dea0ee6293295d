//! Subscribe seam.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::BrokerError;

/// Receives raw payloads from a consumer.
///
/// Called on the consumer's task, so implementations must not block.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one payload. The message is acknowledged when this returns.
    fn handle(&self, payload: &[u8]);
}

/// A running consumer attached to one topic and delivery group.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Stop consuming and close broker connections.
    async fn stop(&mut self);

    /// Whether the consumer is still running.
    fn is_running(&self) -> bool;
}

/// Creates consumers.
///
/// Consumers sharing a `group` split the topic's messages between them;
/// every distinct group receives all of them.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Start consuming `topic` as a member of `group`.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn Consumer>, BrokerError>;
}
