//! Delivery-group naming.
//!
//! The group name doubles as the NSQ channel name. A lowercase SHA-256 hex
//! digest is exactly 64 characters, the NSQ limit, and only uses characters
//! NSQ accepts.

use sha2::{Digest, Sha256};
use tracing::warn;

/// Delivery group for a host identity.
#[must_use]
pub fn delivery_group_name(host: &str) -> String {
    Sha256::digest(host.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Host name of this machine, or `localhost` if it cannot be read.
#[must_use]
pub fn local_host_identity() -> String {
    match hostname::get().map(|h| h.into_string()) {
        Ok(Ok(name)) => name,
        Ok(Err(raw)) => {
            warn!(hostname = ?raw, "Hostname is not valid UTF-8, using lossy form");
            raw.to_string_lossy().into_owned()
        }
        Err(e) => {
            warn!(error = %e, "Failed to read hostname, falling back to localhost");
            "localhost".to_string()
        }
    }
}

/// Delivery group of the current process.
#[must_use]
pub fn local_delivery_group() -> String {
    delivery_group_name(&local_host_identity())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_name_is_deterministic() {
        assert_eq!(delivery_group_name("chat-1"), delivery_group_name("chat-1"));
        assert_ne!(delivery_group_name("chat-1"), delivery_group_name("chat-2"));
    }

    #[test]
    fn test_group_name_is_valid_nsq_channel() {
        let name = delivery_group_name("chat-1.internal");
        assert_eq!(name.len(), 64);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            delivery_group_name("localhost"),
            "49960de5880e8c687434170f6476605b8fe4aeb9a28632c7995cf3ba831d9763"
        );
    }

    #[test]
    fn test_local_group_stable() {
        assert_eq!(local_delivery_group(), local_delivery_group());
    }
}
