//! Transport abstraction traits for Relay.
//!
//! These traits define the interface every socket adapter provides, so the
//! connection lifecycle does not depend on a particular WebSocket stack.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// WebSocket close status codes used by Relay.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away (page navigation, server shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// Frame exceeded the size cap.
    pub const TOO_BIG: u16 = 1009;

    /// Whether a close status is part of ordinary client churn.
    ///
    /// A close frame without a status code counts as expected.
    #[must_use]
    pub fn is_expected(code: Option<u16>) -> bool {
        matches!(code, None | Some(NORMAL | GOING_AWAY | ABNORMAL))
    }
}

/// A single socket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 data frame.
    Text(String),
    /// Binary data frame.
    Binary(Bytes),
    /// Liveness probe.
    Ping(Bytes),
    /// Liveness reply.
    Pong(Bytes),
    /// Close frame with an optional status code.
    Close(Option<u16>),
}

impl WireFrame {
    /// Payload of a data frame; `None` for control frames.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            WireFrame::Text(text) => Some(text.as_bytes()),
            WireFrame::Binary(data) => Some(data),
            _ => None,
        }
    }

    /// Empty ping frame.
    #[must_use]
    pub fn ping() -> Self {
        WireFrame::Ping(Bytes::new())
    }

    /// Close frame with an empty payload.
    #[must_use]
    pub fn close() -> Self {
        WireFrame::Close(None)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed or reset by the peer.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A read or write deadline elapsed.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this error is the peer dropping the connection, as opposed
    /// to a protocol or I/O fault worth reporting.
    #[must_use]
    pub fn is_expected_close(&self) -> bool {
        match self {
            TransportError::ConnectionClosed => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Write half of a socket.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame and flush it.
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;
}

/// Read half of a socket.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` when the stream ends without a close frame.
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError>;
}

/// A bidirectional socket that can be split into independent halves.
pub trait Socket: Send + 'static {
    /// Write half.
    type Sink: FrameSink + 'static;
    /// Read half.
    type Source: FrameSource + 'static;

    /// Split into write and read halves.
    fn split(self) -> (Self::Sink, Self::Source);
}
