//! In-process socket pair.
//!
//! [`pair`] returns a server-side [`MemorySocket`] and the [`MemoryPeer`]
//! playing the browser. Dropping the peer ends the server's read stream the
//! way a TCP reset would.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::traits::{FrameSink, FrameSource, Socket, TransportError, WireFrame};

/// Create a connected socket pair with `capacity` buffered frames each way.
#[must_use]
pub fn pair(capacity: usize) -> (MemorySocket, MemoryPeer) {
    let (to_server, from_peer) = mpsc::channel(capacity);
    let (to_peer, from_server) = mpsc::channel(capacity);
    (
        MemorySocket {
            tx: to_peer,
            rx: from_peer,
        },
        MemoryPeer {
            tx: Some(to_server),
            rx: from_server,
        },
    )
}

/// Server side of an in-memory connection.
#[derive(Debug)]
pub struct MemorySocket {
    tx: mpsc::Sender<WireFrame>,
    rx: mpsc::Receiver<WireFrame>,
}

impl Socket for MemorySocket {
    type Sink = MemorySink;
    type Source = MemorySource;

    fn split(self) -> (MemorySink, MemorySource) {
        (MemorySink(self.tx), MemorySource(self.rx))
    }
}

/// Write half of a [`MemorySocket`].
#[derive(Debug)]
pub struct MemorySink(mpsc::Sender<WireFrame>);

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        self.0
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

/// Read half of a [`MemorySocket`].
#[derive(Debug)]
pub struct MemorySource(mpsc::Receiver<WireFrame>);

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        Ok(self.0.recv().await)
    }
}

/// Client side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    tx: Option<mpsc::Sender<WireFrame>>,
    rx: mpsc::Receiver<WireFrame>,
}

impl MemoryPeer {
    /// Send a frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the server dropped
    /// its read half or the peer hung up.
    pub async fn send(&self, frame: WireFrame) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Send a text frame.
    ///
    /// # Errors
    ///
    /// See [`MemoryPeer::send`].
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(WireFrame::Text(text.into())).await
    }

    /// Receive the next frame written by the server.
    ///
    /// Returns `None` once the server dropped its write half.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.rx.recv().await
    }

    /// Receive the next data frame, skipping pings.
    pub async fn recv_data(&mut self) -> Option<WireFrame> {
        loop {
            match self.rx.recv().await? {
                WireFrame::Ping(_) | WireFrame::Pong(_) => continue,
                frame => return Some(frame),
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<WireFrame> {
        self.rx.try_recv().ok()
    }

    /// Stop sending; the server sees its stream end.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }
}
