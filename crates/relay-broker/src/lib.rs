//! # relay-broker
//!
//! Bridge between the local [`Hub`](relay_core::Hub) and a shared NSQ topic.
//!
//! Outgoing messages are published over nsqd's HTTP API. Incoming messages
//! arrive through one consumer per *delivery group* (an NSQ channel). The
//! group name is derived from the host name, so:
//!
//! - distinct hosts get distinct groups and each sees every message;
//! - every hub inside one process shares a single consumer, held by the
//!   [`SubscriptionRegistry`].
//!
//! ```text
//!  connection ──publish──▶ NsqPublisher ──HTTP /pub──▶ nsqd
//!                                                       │
//!  Hub ◀──deliver── HubFanout ◀── NsqConsumer ◀──TCP────┘
//! ```
//!
//! [`MemoryBroker`] implements the same seams in-process for single-node
//! deployments and tests.

pub mod error;
pub mod group;
pub mod memory;
pub mod nsq;
pub mod registry;
pub mod subscriber;

pub use error::BrokerError;
pub use group::{delivery_group_name, local_delivery_group};
pub use memory::MemoryBroker;
pub use nsq::{ConsumerConfig, NsqPublisher, NsqSubscriber};
pub use registry::{Ensured, SubscriptionRegistry};
pub use subscriber::{Consumer, MessageHandler, Subscriber};
