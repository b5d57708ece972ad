//! Framed codecs for both ends of a driftq TCP session.
//!
//! [`ClientCodec`] is the consumer side: it decodes broker frames and encodes
//! commands. [`BrokerCodec`] is the mirror image, used by broker loops and by
//! test harnesses standing in for one. Neither codec handles the 4-byte magic
//! preamble; that is written (and read) raw before framing begins.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Command, Frame, FrameType, Message, MAX_FRAME_SIZE};
use crate::DriftqError;

const FRAME_TYPE_SIZE: usize = 4;

/// Consumer-side codec: `Decoder<Item = Frame>` + `Encoder<Command>`.
#[derive(Debug, Default)]
pub struct ClientCodec {
    _private: (),
}

impl ClientCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ClientCodec {
    type Item = Frame;
    type Error = DriftqError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DriftqError> {
        decode_frame(src)
    }
}

impl Encoder<Command> for ClientCodec {
    type Error = DriftqError;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), DriftqError> {
        cmd.write(dst);
        Ok(())
    }
}

/// Broker-side codec: `Decoder<Item = Command>` + `Encoder<Frame>`.
#[derive(Debug, Default)]
pub struct BrokerCodec {
    _private: (),
}

impl BrokerCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for BrokerCodec {
    type Item = Command;
    type Error = DriftqError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, DriftqError> {
        let Some(newline) = src.iter().position(|&b| b == b'\n') else {
            if src.len() > MAX_FRAME_SIZE as usize {
                return Err(DriftqError::Protocol("command line too long".to_string()));
            }
            return Ok(None);
        };
        let line = src.split_to(newline + 1);
        Command::parse(&line[..newline]).map(Some)
    }
}

impl Encoder<Frame> for BrokerCodec {
    type Error = DriftqError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), DriftqError> {
        let (frame_type, payload_len) = match &frame {
            Frame::Response(data) | Frame::Error(data) => (frame.frame_type(), data.len()),
            Frame::Message(msg) => (FrameType::Message, msg.encoded_len()),
        };
        let size = FRAME_TYPE_SIZE + payload_len;
        if size as u64 > MAX_FRAME_SIZE as u64 {
            return Err(DriftqError::Protocol(format!("frame too large ({} bytes)", size)));
        }

        dst.reserve(4 + size);
        dst.put_u32(size as u32);
        dst.put_u32(frame_type as u32);
        match frame {
            Frame::Response(data) | Frame::Error(data) => dst.put_slice(&data),
            Frame::Message(msg) => msg.encode(dst),
        }
        Ok(())
    }
}

fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>, DriftqError> {
    if src.len() < 4 {
        return Ok(None);
    }

    let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
    if size < FRAME_TYPE_SIZE as u32 || size > MAX_FRAME_SIZE {
        return Err(DriftqError::Protocol(format!("malformed frame size {}", size)));
    }
    if src.len() < 4 + size as usize {
        src.reserve(4 + size as usize - src.len());
        return Ok(None);
    }

    src.advance(4);
    let mut payload = src.split_to(size as usize).freeze();
    let frame_type = FrameType::try_from(payload.get_u32())?;
    let frame = match frame_type {
        FrameType::Response => Frame::Response(payload),
        FrameType::Error => Frame::Error(payload),
        FrameType::Message => Frame::Message(Message::decode(payload)?),
    };
    Ok(Some(frame))
}
