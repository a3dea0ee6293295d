//! Client identity and the Hub's handle on a connection.

use relay_protocol::{Message, Origin};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// An authenticated user, supplied by session lookup.
///
/// One user may hold several connections (tabs, devices), so a user is not
/// a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Opaque user id.
    pub id: String,
    /// Display name.
    pub name: String,
}

impl User {
    /// Create a user.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Opaque handle identifying one connection in the Hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocate a process-unique id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// What the Hub holds for a registered client: where to route and where
/// to enqueue.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    channel: String,
    user: User,
    outbound: mpsc::Sender<Arc<Message>>,
}

impl ClientHandle {
    /// Create a handle with a bounded outbound queue of `capacity` messages.
    ///
    /// The receiver is the connection's write path.
    #[must_use]
    pub fn new(
        user: User,
        channel: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<Message>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ClientId::next(),
            channel: channel.into(),
            user,
            outbound,
        };
        (handle, rx)
    }

    /// Client id.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Channel this client is scoped to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Authenticated user.
    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    /// Identity stamped onto messages read from this client.
    #[must_use]
    pub fn origin(&self) -> Origin {
        Origin::new(&self.user.id, &self.user.name, &self.channel)
    }

    pub(crate) fn outbound(&self) -> &mpsc::Sender<Arc<Message>> {
        &self.outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ids_are_unique() {
        let a = ClientId::next();
        let b = ClientId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("client-"));
    }

    #[test]
    fn test_handle_origin() {
        let (handle, _rx) = ClientHandle::new(User::new("u-1", "alice"), "lobby", 4);
        let origin = handle.origin();
        assert_eq!(origin.user_id, "u-1");
        assert_eq!(origin.user_name, "alice");
        assert_eq!(origin.channel, "lobby");
        assert_eq!(handle.channel(), "lobby");
    }
}
