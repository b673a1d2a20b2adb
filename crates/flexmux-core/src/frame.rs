//! Frame types carried over a session.

use bytes::Bytes;

/// Largest stream id representable on the wire (ids are 31-bit).
pub const MAX_STREAM_ID: u32 = (1 << 31) - 1;

/// Discriminant of a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Control,
    Data,
    Ping,
    Disconnection,
}

/// Control or data frame addressed to one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    /// Target stream. Ignored (and overwritten) when the frame opens a local stream.
    pub stream_id: u32,
    /// Half-close: the sender will not send anything else on this stream.
    pub end_stream: bool,
    /// Last fragment of one logical message.
    pub end_frame: bool,
    pub payload: Bytes,
}

impl MessageFrame {
    /// A complete, single-fragment message that keeps the stream open.
    pub fn new(stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            end_stream: false,
            end_frame: true,
            payload: payload.into(),
        }
    }

    pub fn with_end_stream(mut self, end_stream: bool) -> Self {
        self.end_stream = end_stream;
        self
    }

    pub fn with_end_frame(mut self, end_frame: bool) -> Self {
        self.end_frame = end_frame;
        self
    }
}

/// Liveness probe. A request is answered by the session itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PingFrame {
    pub reply: bool,
}

impl PingFrame {
    pub fn request() -> Self {
        Self { reply: false }
    }

    pub fn reply() -> Self {
        Self { reply: true }
    }
}

/// Terminates the whole session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisconnectionFrame {
    pub reason: Bytes,
}

impl DisconnectionFrame {
    pub fn new(reason: impl Into<Bytes>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(MessageFrame),
    Data(MessageFrame),
    Ping(PingFrame),
    Disconnection(DisconnectionFrame),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Control(_) => FrameKind::Control,
            Frame::Data(_) => FrameKind::Data,
            Frame::Ping(_) => FrameKind::Ping,
            Frame::Disconnection(_) => FrameKind::Disconnection,
        }
    }

    /// The control/data part of the frame, if it targets a stream.
    pub fn as_message(&self) -> Option<&MessageFrame> {
        match self {
            Frame::Control(m) | Frame::Data(m) => Some(m),
            _ => None,
        }
    }

    pub fn stream_id(&self) -> Option<u32> {
        self.as_message().map(|m| m.stream_id)
    }

    pub fn end_stream(&self) -> bool {
        self.as_message().is_some_and(|m| m.end_stream)
    }

    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Control(m) | Frame::Data(m) => m.payload.len(),
            Frame::Ping(_) => 0,
            Frame::Disconnection(d) => d.reason.len(),
        }
    }
}

impl From<PingFrame> for Frame {
    fn from(ping: PingFrame) -> Self {
        Frame::Ping(ping)
    }
}

impl From<DisconnectionFrame> for Frame {
    fn from(frame: DisconnectionFrame) -> Self {
        Frame::Disconnection(frame)
    }
}
