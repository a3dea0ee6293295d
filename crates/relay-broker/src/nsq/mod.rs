//! NSQ adapter: HTTP publishing, lookupd discovery and a V2 TCP consumer.

pub mod consumer;
pub mod lookupd;
pub mod protocol;
pub mod publisher;

pub use consumer::{ConsumerConfig, NsqConsumer, NsqSubscriber};
pub use lookupd::{LookupClient, Producer};
pub use publisher::NsqPublisher;
