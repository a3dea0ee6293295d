//! Connection lifecycle.
//!
//! [`start`] registers a client with the [`Hub`] and runs two tasks over the
//! split socket:
//!
//! - the **read path** waits for frames under a read deadline, stamps data
//!   frames with the session identity and publishes them;
//! - the **write path** drains the client's outbound queue and sends a ping
//!   every `ping_period`.
//!
//! Whichever path stops first tears the connection down. The read path owns
//! a guard that leaves the hub on drop, and each path holds a oneshot sender
//! the other one watches, so neither outlives its sibling.

use crate::client::{ClientHandle, ClientId, User};
use crate::hub::{Hub, HubError};
use crate::publisher::{publish_with_retry, PublishError, Publisher, RetryPolicy};
use relay_protocol::codec::{self, ProtocolError, DEFAULT_MAX_MESSAGE_SIZE};
use relay_protocol::{Message, Origin};
use relay_transport::{close_code, FrameSink, FrameSource, Socket, TransportError, WireFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the outbound message queue.
    pub message_buffer_size: usize,
    /// Largest accepted inbound data frame, in bytes.
    pub max_message_size: usize,
    /// Read deadline; a connection silent for this long is closed.
    pub pong_wait: Duration,
    /// Deadline for a single frame write.
    pub write_wait: Duration,
    /// Retry policy for publishing inbound messages.
    pub retry: RetryPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            message_buffer_size: 256,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            pong_wait: Duration::from_secs(30),
            write_wait: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Ping interval: nine tenths of the read deadline, so every deadline
    /// window contains at least one ping.
    #[must_use]
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

/// Why the read path stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame (status code, if any) or the stream ended.
    PeerClosed(Option<u16>),
    /// Nothing arrived within the read deadline.
    Timeout,
    /// Malformed or oversized data frame.
    ProtocolViolation,
    /// The broker rejected a publish.
    PublishRejected,
    /// Socket read failed.
    TransportFailed,
    /// The write path stopped first.
    WriterClosed,
    /// The read task was cancelled or panicked.
    Aborted,
}

/// Handle to a running connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ClientId,
    reader: JoinHandle<CloseReason>,
    writer: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Client id registered with the hub.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Whether both paths have stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.writer.is_finished()
    }

    /// Wait for both paths to stop.
    pub async fn closed(self) -> CloseReason {
        let reason = self.reader.await.unwrap_or(CloseReason::Aborted);
        let _ = self.writer.await;
        reason
    }
}

/// Register a connection with `hub` and spawn its read and write paths.
///
/// # Errors
///
/// Returns [`HubError::Closed`] if the hub has shut down; the socket is
/// dropped in that case.
pub fn start<S: Socket>(
    socket: S,
    user: User,
    channel: impl Into<String>,
    hub: &Hub,
    publisher: Arc<dyn Publisher>,
    config: ConnectionConfig,
) -> Result<ConnectionHandle, HubError> {
    let (client, outbound) = ClientHandle::new(user, channel, config.message_buffer_size);
    let id = client.id();
    let origin = client.origin();
    hub.join(client)?;

    debug!(client = %id, channel = %origin.channel, user = %origin.user_id, "Connection opened");

    let (sink, source) = socket.split();
    let (reader_alive, reader_gone) = oneshot::channel();
    let (writer_alive, writer_gone) = oneshot::channel();

    let writer = tokio::spawn(
        WritePath {
            id,
            channel: origin.channel.clone(),
            write_wait: config.write_wait,
            ping_period: config.ping_period(),
            _alive: writer_alive,
        }
        .run(sink, outbound, reader_gone),
    );

    let reader = tokio::spawn(
        ReadPath {
            id,
            origin,
            publisher,
            config,
            _leave: LeaveGuard {
                hub: hub.clone(),
                id,
            },
            _alive: reader_alive,
        }
        .run(source, writer_gone),
    );

    Ok(ConnectionHandle { id, reader, writer })
}

/// Leaves the hub when dropped, on every exit path of the read task.
struct LeaveGuard {
    hub: Hub,
    id: ClientId,
}

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        if self.hub.leave(self.id).is_err() {
            trace!(client = %self.id, "Hub already stopped");
        }
    }
}

struct ReadPath {
    id: ClientId,
    origin: Origin,
    publisher: Arc<dyn Publisher>,
    config: ConnectionConfig,
    _leave: LeaveGuard,
    _alive: oneshot::Sender<()>,
}

impl ReadPath {
    async fn run<R: FrameSource>(
        self,
        mut source: R,
        mut writer_gone: oneshot::Receiver<()>,
    ) -> CloseReason {
        let id = self.id;
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut writer_gone => {
                    debug!(client = %id, "Write path closed");
                    return CloseReason::WriterClosed;
                }
                next = timeout(self.config.pong_wait, source.recv()) => next,
            };

            let frame = match next {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => {
                    debug!(client = %id, "Stream ended without close frame");
                    return CloseReason::PeerClosed(Some(close_code::ABNORMAL));
                }
                Ok(Err(e)) => return self.read_failed(&e),
                Err(_) => {
                    info!(client = %id, wait = ?self.config.pong_wait, "Read deadline expired");
                    return CloseReason::Timeout;
                }
            };

            if let WireFrame::Close(code) = frame {
                if close_code::is_expected(code) {
                    debug!(client = %id, code = ?code, "Client closed connection");
                } else {
                    warn!(client = %id, code = ?code, "Unexpected close status");
                }
                return CloseReason::PeerClosed(code);
            }

            // Ping and pong only refresh the deadline.
            let Some(data) = frame.data() else {
                trace!(client = %id, "Liveness frame");
                continue;
            };

            let (message, encoded) =
                match codec::ingest(data, &self.origin, self.config.max_message_size) {
                    Ok(ingested) => ingested,
                    Err(ProtocolError::FrameTooLarge { size, max }) => {
                        warn!(client = %id, size, max, "Frame too large");
                        return CloseReason::ProtocolViolation;
                    }
                    Err(e) => {
                        warn!(client = %id, error = %e, "Malformed frame");
                        return CloseReason::ProtocolViolation;
                    }
                };

            if let Some(reason) = self.publish(&message, encoded).await {
                return reason;
            }
        }
    }

    async fn publish(&self, message: &Message, encoded: bytes::Bytes) -> Option<CloseReason> {
        match publish_with_retry(self.publisher.as_ref(), encoded, &self.config.retry).await {
            Ok(()) => {
                trace!(client = %self.id, channel = %message.channel, "Published");
                None
            }
            Err(e @ PublishError::Retryable(_)) => {
                warn!(client = %self.id, error = %e, "Dropping message after publish retries");
                None
            }
            Err(e @ PublishError::Fatal(_)) => {
                error!(client = %self.id, error = %e, "Broker rejected message, closing connection");
                Some(CloseReason::PublishRejected)
            }
        }
    }

    fn read_failed(&self, e: &TransportError) -> CloseReason {
        if e.is_expected_close() {
            debug!(client = %self.id, "Connection reset by peer");
            CloseReason::PeerClosed(Some(close_code::ABNORMAL))
        } else {
            warn!(client = %self.id, error = %e, "Socket read failed");
            CloseReason::TransportFailed
        }
    }
}

struct WritePath {
    id: ClientId,
    channel: String,
    write_wait: Duration,
    ping_period: Duration,
    _alive: oneshot::Sender<()>,
}

impl WritePath {
    async fn run<W: FrameSink>(
        self,
        mut sink: W,
        mut outbound: mpsc::Receiver<Arc<Message>>,
        mut reader_gone: oneshot::Receiver<()>,
    ) {
        let id = self.id;
        let mut ticker = interval_at(Instant::now() + self.ping_period, self.ping_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                next = outbound.recv() => match next {
                    Some(message) => {
                        if message.channel != self.channel {
                            trace!(client = %id, channel = %message.channel, "Dropping message for other channel");
                            continue;
                        }
                        let text = match codec::encode_text(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                error!(client = %id, error = %e, "Failed to encode message");
                                continue;
                            }
                        };
                        if let Err(e) = self.send(&mut sink, WireFrame::Text(text)).await {
                            debug!(client = %id, error = %e, "Write failed");
                            return;
                        }
                    }
                    None => {
                        debug!(client = %id, "Outbound queue closed");
                        let _ = self.send(&mut sink, WireFrame::close()).await;
                        return;
                    }
                },

                _ = ticker.tick() => {
                    if let Err(e) = self.send(&mut sink, WireFrame::ping()).await {
                        debug!(client = %id, error = %e, "Ping failed");
                        return;
                    }
                }

                _ = &mut reader_gone => {
                    let _ = self.send(&mut sink, WireFrame::close()).await;
                    return;
                }
            }
        }
    }

    async fn send<W: FrameSink>(&self, sink: &mut W, frame: WireFrame) -> Result<(), TransportError> {
        timeout(self.write_wait, sink.send(frame))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}
