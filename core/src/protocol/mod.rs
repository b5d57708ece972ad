//! Driftq wire protocol
//!
//! A session begins with the client writing the 4-byte magic identifier
//! ([`MAGIC_V2`]). After that the broker speaks length-prefixed frames and the
//! client speaks line-oriented ASCII commands:
//!
//! ```text
//! frame:   [u32 size][u32 frame type][size - 4 bytes of payload]
//! command: TOKEN [arg ...]\n
//! ```
//!
//! All integers are big-endian. A message frame's payload carries
//! `[i64 timestamp][u16 attempts][16-byte id][body...]`.

pub mod codec;

pub use codec::{BrokerCodec, ClientCodec};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::{DriftqError, Result};

/// Protocol magic written by a client immediately after connecting:
/// two spaces followed by `V2`.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Upper bound on the RDY credit a single connection may advertise.
pub const MAX_RDY_COUNT: i64 = 2500;

/// Largest frame either codec will accept on the wire.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Payload of the response frame a broker sends as a keepalive probe.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Payload of the response frame acknowledging a client-initiated `CLS`.
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// Length of a message identifier in bytes.
pub const MSG_ID_LENGTH: usize = 16;

const MSG_HEADER_SIZE: usize = 8 + 2 + MSG_ID_LENGTH;
const MAX_NAME_LENGTH: usize = 64;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// 16-byte ASCII message identifier assigned by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MSG_ID_LENGTH]);

impl MessageId {
    pub const fn new(bytes: [u8; MSG_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse an identifier out of a wire buffer.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let id: [u8; MSG_ID_LENGTH] = bytes
            .try_into()
            .map_err(|_| DriftqError::Protocol(format!("invalid message id length {}", bytes.len())))?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; MSG_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl AsRef<[u8]> for MessageId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A single queued message. Immutable after decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Broker-assigned identifier
    pub id: MessageId,
    /// Number of delivery attempts so far, including this one
    pub attempts: u16,
    /// Nanoseconds since the unix epoch at enqueue time
    pub timestamp: i64,
    /// Opaque payload
    pub body: Bytes,
}

impl Message {
    pub fn new(id: MessageId, timestamp: i64, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            attempts: 0,
            timestamp,
            body: body.into(),
        }
    }

    /// Decode a message frame payload.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < MSG_HEADER_SIZE {
            return Err(DriftqError::Protocol(format!(
                "message payload too short ({} bytes)",
                data.len()
            )));
        }
        let timestamp = data.get_i64();
        let attempts = data.get_u16();
        let id = MessageId::from_slice(&data.split_to(MSG_ID_LENGTH))?;
        Ok(Self {
            id,
            attempts,
            timestamp,
            body: data,
        })
    }

    /// Encode this message as a frame payload.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_i64(self.timestamp);
        dst.put_u16(self.attempts);
        dst.put_slice(self.id.as_bytes());
        dst.put_slice(&self.body);
    }

    pub fn encoded_len(&self) -> usize {
        MSG_HEADER_SIZE + self.body.len()
    }
}

/// Discriminant carried in the second word of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    Response = 0,
    Error = 1,
    Message = 2,
}

impl TryFrom<u32> for FrameType {
    type Error = DriftqError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(FrameType::Response),
            1 => Ok(FrameType::Error),
            2 => Ok(FrameType::Message),
            other => Err(DriftqError::Protocol(format!("unknown frame type {}", other))),
        }
    }
}

/// A decoded broker-to-client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(Message),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Response(_) => FrameType::Response,
            Frame::Error(_) => FrameType::Error,
            Frame::Message(_) => FrameType::Message,
        }
    }

    /// True for the broker's keepalive probe, which must be answered with `NOP`.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(data) if data.as_ref() == HEARTBEAT)
    }
}

/// A client-to-broker command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Subscribe to a (topic, channel) pair
    Sub { topic: String, channel: String },
    /// Advertise RDY credit
    Rdy(i64),
    /// Acknowledge successful processing
    Fin(MessageId),
    /// Requeue after a delay in milliseconds
    Req { id: MessageId, delay_ms: u64 },
    /// Start a graceful close; the broker answers `CLOSE_WAIT`
    Cls,
    /// Keepalive answer to a heartbeat
    Nop,
}

impl Command {
    /// Render this command as its wire line, including the trailing newline.
    pub fn write(&self, dst: &mut BytesMut) {
        match self {
            Command::Sub { topic, channel } => {
                dst.put_slice(b"SUB ");
                dst.put_slice(topic.as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(channel.as_bytes());
            }
            Command::Rdy(count) => {
                dst.put_slice(b"RDY ");
                dst.put_slice(count.to_string().as_bytes());
            }
            Command::Fin(id) => {
                dst.put_slice(b"FIN ");
                dst.put_slice(id.as_bytes());
            }
            Command::Req { id, delay_ms } => {
                dst.put_slice(b"REQ ");
                dst.put_slice(id.as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(delay_ms.to_string().as_bytes());
            }
            Command::Cls => dst.put_slice(b"CLS"),
            Command::Nop => dst.put_slice(b"NOP"),
        }
        dst.put_u8(b'\n');
    }

    /// Parse one command line (without its trailing newline).
    pub fn parse(line: &[u8]) -> Result<Self> {
        let line = std::str::from_utf8(line)
            .map_err(|_| DriftqError::Protocol("command is not valid utf-8".to_string()))?;
        let mut tokens = line.split(' ');
        let token = tokens.next().unwrap_or("");
        let cmd = match token {
            "SUB" => {
                let topic = tokens
                    .next()
                    .ok_or_else(|| DriftqError::Protocol("SUB missing topic".to_string()))?;
                let channel = tokens
                    .next()
                    .ok_or_else(|| DriftqError::Protocol("SUB missing channel".to_string()))?;
                Command::Sub {
                    topic: topic.to_string(),
                    channel: channel.to_string(),
                }
            }
            "RDY" => {
                let count = tokens
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| DriftqError::Protocol("RDY missing count".to_string()))?;
                Command::Rdy(count)
            }
            "FIN" => {
                let id = tokens
                    .next()
                    .ok_or_else(|| DriftqError::Protocol("FIN missing id".to_string()))?;
                Command::Fin(MessageId::from_slice(id.as_bytes())?)
            }
            "REQ" => {
                let id = tokens
                    .next()
                    .ok_or_else(|| DriftqError::Protocol("REQ missing id".to_string()))?;
                let delay_ms = tokens
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| DriftqError::Protocol("REQ missing delay".to_string()))?;
                Command::Req {
                    id: MessageId::from_slice(id.as_bytes())?,
                    delay_ms,
                }
            }
            "CLS" => Command::Cls,
            "NOP" => Command::Nop,
            other => {
                return Err(DriftqError::Protocol(format!("unknown command {:?}", other)));
            }
        };
        if tokens.next().is_some() {
            return Err(DriftqError::Protocol(format!(
                "trailing arguments for {}",
                token
            )));
        }
        Ok(cmd)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Sub { .. } => write!(f, "SUB"),
            Command::Rdy(_) => write!(f, "RDY"),
            Command::Fin(_) => write!(f, "FIN"),
            Command::Req { .. } => write!(f, "REQ"),
            Command::Cls => write!(f, "CLS"),
            Command::Nop => write!(f, "NOP"),
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && name
            .chars()
            .all(|c| c == '.' || c == '_' || c == '-' || c.is_ascii_alphanumeric())
}

/// Validate a topic name: non-empty, at most 64 characters from `[.a-zA-Z0-9_-]`.
pub fn is_valid_topic_name(name: &str) -> bool {
    is_valid_name(name)
}

/// Validate a channel name: topic rules, optionally followed by `#ephemeral`.
pub fn is_valid_channel_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LENGTH {
        return false;
    }
    is_valid_name(name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_id() -> MessageId {
        MessageId::new(*b"0123456789abcdef")
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = Message {
            id: test_id(),
            attempts: 3,
            timestamp: 1_690_000_000_000_000_000,
            body: Bytes::from_static(b"hello"),
        };

        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(buf.len(), msg.encoded_len());

        let decoded = Message::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_message_decode_short_payload() {
        let err = Message::decode(Bytes::from_static(b"tiny")).unwrap_err();
        assert!(matches!(err, DriftqError::Protocol(_)));
    }

    #[test]
    fn test_message_id_display() {
        assert_eq!(test_id().to_string(), "0123456789abcdef");
    }

    #[test]
    fn test_command_lines() {
        let cases: Vec<(Command, &[u8])> = vec![
            (
                Command::Sub {
                    topic: "orders".to_string(),
                    channel: "archive".to_string(),
                },
                b"SUB orders archive\n",
            ),
            (Command::Rdy(50), b"RDY 50\n"),
            (Command::Fin(test_id()), b"FIN 0123456789abcdef\n"),
            (
                Command::Req {
                    id: test_id(),
                    delay_ms: 1000,
                },
                b"REQ 0123456789abcdef 1000\n",
            ),
            (Command::Cls, b"CLS\n"),
            (Command::Nop, b"NOP\n"),
        ];

        for (cmd, line) in cases {
            let mut buf = BytesMut::new();
            cmd.write(&mut buf);
            assert_eq!(&buf[..], line);

            let parsed = Command::parse(&line[..line.len() - 1]).unwrap();
            assert_eq!(parsed, cmd);
        }
    }

    #[test]
    fn test_command_parse_rejects_garbage() {
        assert!(Command::parse(b"PUB orders").is_err());
        assert!(Command::parse(b"RDY").is_err());
        assert!(Command::parse(b"RDY fifty").is_err());
        assert!(Command::parse(b"FIN short-id").is_err());
        assert!(Command::parse(b"NOP extra").is_err());
        assert!(Command::parse(b"").is_err());
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_topic_name("orders"));
        assert!(is_valid_topic_name("orders.v2_backup-1"));
        assert!(!is_valid_topic_name(""));
        assert!(!is_valid_topic_name("orders!"));
        assert!(!is_valid_topic_name(&"x".repeat(65)));

        assert!(is_valid_channel_name("archive"));
        assert!(is_valid_channel_name("archive#ephemeral"));
        assert!(!is_valid_channel_name("#ephemeral"));
        assert!(!is_valid_channel_name("bad name#ephemeral"));
    }

    #[test]
    fn test_heartbeat_detection() {
        assert!(Frame::Response(Bytes::from_static(HEARTBEAT)).is_heartbeat());
        assert!(!Frame::Response(Bytes::from_static(b"OK")).is_heartbeat());
        assert!(!Frame::Error(Bytes::from_static(HEARTBEAT)).is_heartbeat());
    }

    proptest! {
        #[test]
        fn prop_message_roundtrip(
            id in proptest::array::uniform16(any::<u8>()),
            attempts in any::<u16>(),
            timestamp in any::<i64>(),
            body in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let msg = Message {
                id: MessageId::new(id),
                attempts,
                timestamp,
                body: Bytes::from(body),
            };

            let mut buf = BytesMut::new();
            msg.encode(&mut buf);
            let decoded = Message::decode(buf.freeze()).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }
}
