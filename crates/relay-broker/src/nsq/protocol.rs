//! NSQ TCP protocol (V2).
//!
//! ## Frame Format
//!
//! Frames sent by nsqd:
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────────────┐
//! │ size (u32 BE)│ type (i32 BE)│ data (size - 4)    │
//! └──────────────┴──────────────┴────────────────────┘
//! ```
//!
//! A message frame's data is:
//!
//! ```text
//! ┌────────────────┬──────────────┬──────────────┬──────────┐
//! │ timestamp (i64)│ attempts(u16)│ id (16 bytes)│ body ... │
//! └────────────────┴──────────────┴──────────────┴──────────┘
//! ```
//!
//! Commands are newline-terminated text; `IDENTIFY` carries a size-prefixed
//! JSON body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::BrokerError;

/// Protocol magic sent right after connecting.
pub const MAGIC_V2: &[u8] = b"  V2";

/// Response body nsqd sends as a heartbeat.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Response body acknowledging a command.
pub const OK: &[u8] = b"OK";

/// Response body acknowledging `CLS`.
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// Upper bound on an incoming frame.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const FRAME_TYPE_RESPONSE: i32 = 0;
const FRAME_TYPE_ERROR: i32 = 1;
const FRAME_TYPE_MESSAGE: i32 = 2;

const MESSAGE_HEADER_SIZE: usize = 8 + 2 + 16;

/// NSQ message identifier.
pub type MessageId = [u8; 16];

/// Message delivered by nsqd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsqMessage {
    /// Publish time, nanoseconds since the epoch.
    pub timestamp: i64,
    /// Delivery attempts so far.
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

/// Frame received from nsqd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(NsqMessage),
}

/// Command sent to nsqd.
#[derive(Debug, Clone)]
pub enum Command {
    Identify(Bytes),
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Nop,
    Cls,
}

impl Command {
    /// Append the wire form of this command to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Command::Identify(body) => {
                buf.put_slice(b"IDENTIFY\n");
                buf.put_u32(body.len() as u32);
                buf.put_slice(body);
            }
            Command::Sub { topic, channel } => {
                buf.put_slice(format!("SUB {} {}\n", topic, channel).as_bytes());
            }
            Command::Rdy(count) => {
                buf.put_slice(format!("RDY {}\n", count).as_bytes());
            }
            Command::Fin(id) => {
                buf.put_slice(b"FIN ");
                buf.put_slice(id);
                buf.put_u8(b'\n');
            }
            Command::Nop => buf.put_slice(b"NOP\n"),
            Command::Cls => buf.put_slice(b"CLS\n"),
        }
    }

    /// Wire form of this command.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Parse a frame body (type and data, without the size prefix).
///
/// # Errors
///
/// Returns [`BrokerError::Protocol`] on truncated data or an unknown type.
pub fn parse_frame(mut data: Bytes) -> Result<Frame, BrokerError> {
    if data.len() < 4 {
        return Err(BrokerError::Protocol(format!(
            "frame too short: {} bytes",
            data.len()
        )));
    }
    let frame_type = data.get_i32();
    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Frame::Response(data)),
        FRAME_TYPE_ERROR => Ok(Frame::Error(data)),
        FRAME_TYPE_MESSAGE => parse_message(data).map(Frame::Message),
        other => Err(BrokerError::Protocol(format!("unknown frame type {}", other))),
    }
}

fn parse_message(mut data: Bytes) -> Result<NsqMessage, BrokerError> {
    if data.len() < MESSAGE_HEADER_SIZE {
        return Err(BrokerError::Protocol(format!(
            "message frame too short: {} bytes",
            data.len()
        )));
    }
    let timestamp = data.get_i64();
    let attempts = data.get_u16();
    let mut id = [0u8; 16];
    data.copy_to_slice(&mut id);
    Ok(NsqMessage {
        timestamp,
        attempts,
        id,
        body: data,
    })
}

/// Read one size-prefixed frame.
///
/// Not cancel-safe: a partially read frame is lost if the future is dropped.
///
/// # Errors
///
/// Returns an I/O error on EOF or a protocol error on an invalid frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, BrokerError> {
    let size = reader.read_u32().await? as usize;
    if !(4..=MAX_FRAME_SIZE).contains(&size) {
        return Err(BrokerError::Protocol(format!("invalid frame size {}", size)));
    }
    let mut data = vec![0u8; size];
    reader.read_exact(&mut data).await?;
    parse_frame(Bytes::from(data))
}

/// Encode a frame the way nsqd does.
#[cfg(test)]
pub(crate) fn encode_frame(frame: &Frame) -> Bytes {
    let mut data = BytesMut::new();
    match frame {
        Frame::Response(body) => {
            data.put_i32(FRAME_TYPE_RESPONSE);
            data.put_slice(body);
        }
        Frame::Error(body) => {
            data.put_i32(FRAME_TYPE_ERROR);
            data.put_slice(body);
        }
        Frame::Message(msg) => {
            data.put_i32(FRAME_TYPE_MESSAGE);
            data.put_i64(msg.timestamp);
            data.put_u16(msg.attempts);
            data.put_slice(&msg.id);
            data.put_slice(&msg.body);
        }
    }
    let mut out = BytesMut::with_capacity(4 + data.len());
    out.put_u32(data.len() as u32);
    out.put_slice(&data);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> NsqMessage {
        NsqMessage {
            timestamp: 1_700_000_000_000_000_000,
            attempts: 1,
            id: *b"0123456789abcdef",
            body: Bytes::from_static(br#"{"body":"hi"}"#),
        }
    }

    #[test]
    fn test_command_encoding() {
        let sub = Command::Sub {
            topic: "Chat".into(),
            channel: "abc".into(),
        };
        assert_eq!(&sub.to_bytes()[..], b"SUB Chat abc\n");
        assert_eq!(&Command::Rdy(10).to_bytes()[..], b"RDY 10\n");
        assert_eq!(&Command::Nop.to_bytes()[..], b"NOP\n");
        assert_eq!(&Command::Cls.to_bytes()[..], b"CLS\n");
        assert_eq!(
            &Command::Fin(*b"0123456789abcdef").to_bytes()[..],
            b"FIN 0123456789abcdef\n"
        );
    }

    #[test]
    fn test_identify_is_size_prefixed() {
        let body = Bytes::from_static(br#"{"client_id":"a"}"#);
        let encoded = Command::Identify(body.clone()).to_bytes();

        assert!(encoded.starts_with(b"IDENTIFY\n"));
        let rest = &encoded[9..];
        assert_eq!(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize, body.len());
        assert_eq!(&rest[4..], &body[..]);
    }

    #[test]
    fn test_parse_message_frame() {
        let encoded = encode_frame(&Frame::Message(message()));
        let frame = parse_frame(encoded.slice(4..)).unwrap();
        assert_eq!(frame, Frame::Message(message()));
    }

    #[test]
    fn test_parse_response_and_error() {
        let mut data = BytesMut::new();
        data.put_i32(0);
        data.put_slice(HEARTBEAT);
        assert_eq!(
            parse_frame(data.freeze()).unwrap(),
            Frame::Response(Bytes::from_static(HEARTBEAT))
        );

        let mut data = BytesMut::new();
        data.put_i32(1);
        data.put_slice(b"E_INVALID");
        assert_eq!(
            parse_frame(data.freeze()).unwrap(),
            Frame::Error(Bytes::from_static(b"E_INVALID"))
        );
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        assert!(parse_frame(Bytes::from_static(&[0, 0])).is_err());
        assert!(parse_frame(Bytes::from_static(&[0, 0, 0, 9])).is_err());

        let mut truncated = BytesMut::new();
        truncated.put_i32(2);
        truncated.put_i64(0);
        assert!(parse_frame(truncated.freeze()).is_err());
    }

    #[tokio::test]
    async fn test_read_frame_sequence() {
        let mut wire = BytesMut::new();
        wire.put_slice(&encode_frame(&Frame::Response(Bytes::from_static(OK))));
        wire.put_slice(&encode_frame(&Frame::Message(message())));
        let mut reader = &wire[..];

        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::Response(Bytes::from_static(OK))
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Message(message()));
        assert!(matches!(read_frame(&mut reader).await, Err(BrokerError::Io(_))));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized() {
        let wire = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        let mut reader = &wire[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(BrokerError::Protocol(_))
        ));
    }
}
