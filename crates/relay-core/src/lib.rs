//! # relay-core
//!
//! The in-process half of the Relay delivery path.
//!
//! - **Hub** - single-owner actor holding the connected clients
//! - **Client** - the Hub's view of one connection
//! - **Connection** - read/write loops turning a socket into messages
//! - **Publisher** - seam to the broker bridge
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  publish  ┌─────────────┐
//! │ Connection │──────────▶│  Publisher  │──▶ broker
//! └────────────┘           └─────────────┘
//!       ▲                                        │
//!       │ outbound queue                         │ deliver
//!       │                  ┌─────────────┐       │
//!       └──────────────────│     Hub     │◀──────┘
//!                          └─────────────┘
//! ```

pub mod client;
pub mod connection;
pub mod hub;
pub mod publisher;

pub use client::{ClientHandle, ClientId, User};
pub use connection::{CloseReason, ConnectionConfig, ConnectionHandle};
pub use hub::{Hub, HubError, HubId, HubStats};
pub use publisher::{PublishError, Publisher, RetryPolicy};
