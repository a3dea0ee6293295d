//! WebSocket adapter for axum upgrades.
//!
//! axum surfaces read failures as an opaque `axum::Error`; the underlying
//! tungstenite error is recovered so a peer dropping the TCP connection is
//! reported as [`TransportError::ConnectionClosed`].

use std::borrow::Cow;

use async_trait::async_trait;
use axum::extract::ws::{self as axum_ws, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::error::Error as StdError;
use std::io;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::debug;

use crate::traits::{FrameSink, FrameSource, Socket, TransportError, WireFrame};

// -- axum ------------------------------------------------------------------

impl Socket for WebSocket {
    type Sink = AxumSink;
    type Source = AxumSource;

    fn split(self) -> (AxumSink, AxumSource) {
        let (sink, stream) = StreamExt::split(self);
        (AxumSink(sink), AxumSource(stream))
    }
}

/// Write half of an axum WebSocket.
pub struct AxumSink(SplitSink<WebSocket, axum_ws::Message>);

#[async_trait]
impl FrameSink for AxumSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let msg = match frame {
            WireFrame::Text(text) => axum_ws::Message::Text(text),
            WireFrame::Binary(data) => axum_ws::Message::Binary(data.to_vec()),
            WireFrame::Ping(data) => axum_ws::Message::Ping(data.to_vec()),
            WireFrame::Pong(data) => axum_ws::Message::Pong(data.to_vec()),
            WireFrame::Close(code) => axum_ws::Message::Close(code.map(|code| {
                axum_ws::CloseFrame {
                    code,
                    reason: Cow::Borrowed(""),
                }
            })),
        };
        self.0
            .send(msg)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Read half of an axum WebSocket.
pub struct AxumSource(SplitStream<WebSocket>);

#[async_trait]
impl FrameSource for AxumSource {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        let frame = match self.0.next().await {
            Some(Ok(axum_ws::Message::Text(text))) => WireFrame::Text(text),
            Some(Ok(axum_ws::Message::Binary(data))) => WireFrame::Binary(Bytes::from(data)),
            Some(Ok(axum_ws::Message::Ping(data))) => WireFrame::Ping(Bytes::from(data)),
            Some(Ok(axum_ws::Message::Pong(data))) => WireFrame::Pong(Bytes::from(data)),
            Some(Ok(axum_ws::Message::Close(frame))) => {
                WireFrame::Close(frame.map(|f| f.code))
            }
            Some(Err(e)) => return Err(receive_error(e)),
            None => return Ok(None),
        };
        Ok(Some(frame))
    }
}

/// Classify an axum read error.
fn receive_error(error: axum::Error) -> TransportError {
    match error.into_inner().downcast::<WsError>() {
        Ok(ws) => tungstenite_error(*ws),
        Err(other) => match io_source(other.as_ref()) {
            Some(kind) => TransportError::Io(io::Error::new(kind, other.to_string())),
            None => TransportError::ReceiveFailed(other.to_string()),
        },
    }
}

fn tungstenite_error(error: WsError) -> TransportError {
    match error {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
            debug!("Connection closed without handshake");
            TransportError::ConnectionClosed
        }
        WsError::Io(e) => TransportError::Io(e),
        e => TransportError::ReceiveFailed(e.to_string()),
    }
}

/// Kind of the first I/O error in the source chain.
fn io_source(error: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current = Some(error);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            return Some(io.kind());
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::WebSocketUpgrade;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    type Received = Result<Option<WireFrame>, TransportError>;

    /// Serves `/ws`, reporting every frame or error the server reads.
    async fn spawn_server() -> (SocketAddr, mpsc::UnboundedReceiver<Received>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new().route(
            "/ws",
            get(move |ws: WebSocketUpgrade| {
                let tx = tx.clone();
                async move {
                    ws.on_upgrade(move |socket| async move {
                        let (mut sink, mut source) = Socket::split(socket);
                        loop {
                            let received = source.recv().await;
                            let done = !matches!(received, Ok(Some(WireFrame::Text(_))));
                            if let Ok(Some(frame)) = &received {
                                let _ = sink.send(frame.clone()).await;
                            }
                            let _ = tx.send(received);
                            if done {
                                return;
                            }
                        }
                    })
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Received>) -> Received {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("server read nothing")
            .expect("server gone")
    }

    #[tokio::test]
    async fn test_axum_text_echo_and_close() {
        let (addr, mut rx) = spawn_server().await;
        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        client
            .send(WsMessage::Text(r#"{"body":"hi"}"#.into()))
            .await
            .unwrap();
        assert_eq!(
            next(&mut rx).await.unwrap(),
            Some(WireFrame::Text(r#"{"body":"hi"}"#.into()))
        );
        let echoed = timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(echoed, WsMessage::Text(r#"{"body":"hi"}"#.into()));

        client.close(None).await.unwrap();
        assert_eq!(next(&mut rx).await.unwrap(), Some(WireFrame::Close(None)));
    }

    #[tokio::test]
    async fn test_axum_reset_without_handshake_is_expected() {
        let (addr, mut rx) = spawn_server().await;
        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        client.send(WsMessage::Text("{}".into())).await.unwrap();
        assert!(next(&mut rx).await.is_ok());

        // Dropping the stream closes TCP without a close frame, as a browser
        // does on navigation.
        drop(client);

        let err = next(&mut rx).await.unwrap_err();
        assert!(err.is_expected_close(), "got {:?}", err);
    }

    #[test]
    fn test_tungstenite_error_mapping() {
        assert!(tungstenite_error(WsError::ConnectionClosed).is_expected_close());
        assert!(tungstenite_error(WsError::Protocol(
            WsProtocolError::ResetWithoutClosingHandshake
        ))
        .is_expected_close());
        assert!(matches!(
            tungstenite_error(WsError::Io(io::Error::from(io::ErrorKind::TimedOut))),
            TransportError::Io(_)
        ));
        assert!(matches!(
            tungstenite_error(WsError::Utf8),
            TransportError::ReceiveFailed(_)
        ));
    }
}
