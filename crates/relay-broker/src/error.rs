//! Broker errors.

use thiserror::Error;

/// Errors raised by the broker bridge.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No discovery endpoint answered.
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error on a broker connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame or unexpected response from nsqd.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// nsqd answered with an error frame.
    #[error("Broker error: {0}")]
    Remote(String),

    /// Operation did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(&'static str),

    /// The subscription registry was shut down.
    #[error("Subscription registry is shut down")]
    Closed,

    /// Invalid broker configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}
