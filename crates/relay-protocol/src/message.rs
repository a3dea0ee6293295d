//! Chat message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chat event.
///
/// Missing fields deserialize to their defaults so a client may send only
/// `{"body": "..."}`; the server fills the rest in on ingest.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// Display name of the sender.
    #[serde(default)]
    pub name: String,
    /// Chat channel, the routing key for delivery.
    #[serde(default)]
    pub channel: String,
    /// Opaque sender id.
    #[serde(default)]
    pub user: String,
    /// Server-assigned ingest time.
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    /// Message text.
    #[serde(default)]
    pub body: String,
}

impl Message {
    /// Create a message on a channel.
    #[must_use]
    pub fn new(channel: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            body: body.into(),
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    /// Set the sender fields.
    #[must_use]
    pub fn with_sender(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.user = id.into();
        self.name = name.into();
        self
    }

    /// Overwrite every server-owned field from `origin`.
    ///
    /// Only `body` survives from the client-supplied value.
    pub fn stamp(&mut self, origin: &Origin, at: DateTime<Utc>) {
        self.name.clone_from(&origin.user_name);
        self.user.clone_from(&origin.user_id);
        self.channel.clone_from(&origin.channel);
        self.timestamp = at;
    }
}

/// The authenticated identity and channel of one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Sender id from the session.
    pub user_id: String,
    /// Sender display name from the session.
    pub user_name: String,
    /// Channel the socket is scoped to.
    pub channel: String,
}

impl Origin {
    /// Create an origin.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            channel: channel.into(),
        }
    }
}
