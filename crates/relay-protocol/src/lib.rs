//! # relay-protocol
//!
//! Wire format for the Relay chat delivery path.
//!
//! Every data frame on a client socket, and every payload on the broker
//! topic, is a JSON-encoded [`Message`]:
//!
//! ```json
//! { "name": "alice", "channel": "lobby", "user": "u-1",
//!   "timestamp": "2024-05-01T10:00:00Z", "body": "hi" }
//! ```
//!
//! Identity fields are never trusted from a client. [`codec::ingest`]
//! decodes a client frame and stamps it with the authenticated [`Origin`]
//! before it is published.
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Origin};
//!
//! let origin = Origin::new("u-1", "alice", "lobby");
//! let (message, encoded) = codec::ingest(br#"{"body":"hi"}"#, &origin, 512).unwrap();
//!
//! assert_eq!(message.channel, "lobby");
//! assert_eq!(codec::decode(&encoded).unwrap(), message);
//! ```

pub mod codec;
pub mod message;

pub use codec::{decode, encode, ingest, ProtocolError};
pub use message::{Message, Origin};
