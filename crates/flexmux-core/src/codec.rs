//! Wire encoding of frames.
//!
//! The session only deals in typed [`Frame`] values; a [`FrameCodec`] turns them
//! into bytes for the transport and back. [`FlexCodec`] is the default layout:
//!
//! ```text
//! +--------+--------+----------------+----------------+-----------------+
//! | type   | flags  | stream_id (BE) | length (BE)    | payload         |
//! | 1 byte | 1 byte | 4 bytes        | 4 bytes        | `length` bytes  |
//! +--------+--------+----------------+----------------+-----------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    DecodeError, DisconnectionFrame, Frame, MAX_STREAM_ID, MessageFrame, PingFrame,
};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 10;

/// Default payload limit (16 MiB).
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

const TYPE_CONTROL: u8 = 1;
const TYPE_DATA: u8 = 2;
const TYPE_PING: u8 = 3;
const TYPE_DISCONNECTION: u8 = 4;

bitflags::bitflags! {
    /// Header flag bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const END_STREAM = 0b0000_0001;
        const END_FRAME  = 0b0000_0010;
        const REPLY      = 0b0000_0100;
    }
}

/// Encoder/decoder pair used by the session and the transports.
pub trait FrameCodec: Send + Sync + 'static {
    /// Append the encoding of `frame` to `dst`.
    fn encode(&self, frame: &Frame, dst: &mut BytesMut);

    /// Take one frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete frame; nothing
    /// is consumed in that case.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError>;

    fn encode_to_bytes(&self, frame: &Frame) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.payload_len());
        self.encode(frame, &mut buf);
        buf.freeze()
    }
}

/// The default frame layout.
#[derive(Debug, Clone, Copy)]
pub struct FlexCodec {
    max_payload: usize,
}

impl FlexCodec {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_FRAME_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for FlexCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn message_flags(m: &MessageFrame) -> FrameFlags {
    let mut flags = FrameFlags::empty();
    flags.set(FrameFlags::END_STREAM, m.end_stream);
    flags.set(FrameFlags::END_FRAME, m.end_frame);
    flags
}

fn put_header(dst: &mut BytesMut, ty: u8, flags: FrameFlags, stream_id: u32, len: usize) {
    dst.put_u8(ty);
    dst.put_u8(flags.bits());
    dst.put_u32(stream_id);
    dst.put_u32(len as u32);
}

impl FrameCodec for FlexCodec {
    fn encode(&self, frame: &Frame, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + frame.payload_len());
        match frame {
            Frame::Control(m) | Frame::Data(m) => {
                let ty = if matches!(frame, Frame::Control(_)) {
                    TYPE_CONTROL
                } else {
                    TYPE_DATA
                };
                put_header(dst, ty, message_flags(m), m.stream_id, m.payload.len());
                dst.extend_from_slice(&m.payload);
            }
            Frame::Ping(p) => {
                let mut flags = FrameFlags::empty();
                flags.set(FrameFlags::REPLY, p.reply);
                put_header(dst, TYPE_PING, flags, 0, 0);
            }
            Frame::Disconnection(d) => {
                put_header(dst, TYPE_DISCONNECTION, FrameFlags::empty(), 0, d.reason.len());
                dst.extend_from_slice(&d.reason);
            }
        }
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let ty = src[0];
        if !(TYPE_CONTROL..=TYPE_DISCONNECTION).contains(&ty) {
            return Err(DecodeError::UnknownFrameType(ty));
        }
        let flags = FrameFlags::from_bits(src[1]).ok_or(DecodeError::UnknownFlags(src[1]))?;
        let stream_id = u32::from_be_bytes([src[2], src[3], src[4], src[5]]);
        if stream_id > MAX_STREAM_ID {
            return Err(DecodeError::InvalidStreamId(stream_id));
        }
        let len = u32::from_be_bytes([src[6], src[7], src[8], src[9]]) as usize;
        if len > self.max_payload {
            return Err(DecodeError::FrameTooLarge {
                len,
                max: self.max_payload,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        let frame = match ty {
            TYPE_CONTROL | TYPE_DATA => {
                let message = MessageFrame {
                    stream_id,
                    end_stream: flags.contains(FrameFlags::END_STREAM),
                    end_frame: flags.contains(FrameFlags::END_FRAME),
                    payload,
                };
                if ty == TYPE_CONTROL {
                    Frame::Control(message)
                } else {
                    Frame::Data(message)
                }
            }
            TYPE_PING => Frame::Ping(PingFrame {
                reply: flags.contains(FrameFlags::REPLY),
            }),
            _ => Frame::Disconnection(DisconnectionFrame { reason: payload }),
        };
        Ok(Some(frame))
    }
}
