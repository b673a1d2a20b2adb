//! Error types.

use core::fmt;
use std::sync::Arc;

use crate::StreamState;

/// Wire decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownFrameType(u8),
    UnknownFlags(u8),
    FrameTooLarge { len: usize, max: usize },
    InvalidStreamId(u32),
    /// The byte stream ended in the middle of a frame.
    Truncated { buffered: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFrameType(t) => write!(f, "unknown frame type {t}"),
            Self::UnknownFlags(bits) => write!(f, "unknown frame flags {bits:#04x}"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame payload {len} bytes exceeds max {max}")
            }
            Self::InvalidStreamId(id) => write!(f, "stream id {id} does not fit in 31 bits"),
            Self::Truncated { buffered } => {
                write!(f, "input ended inside a frame ({buffered} bytes buffered)")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Transport-level errors.
///
/// Cheap to clone so a single failure can be reported to every abandoned write.
#[derive(Debug, Clone)]
pub enum TransportError {
    Closed,
    Io(Arc<std::io::Error>),
    Decode(DecodeError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e.as_ref()),
            Self::Decode(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// The peer violated the framing protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A data frame referenced a stream that was never opened.
    UnknownStream { stream_id: u32 },
    /// A frame arrived for a stream whose inbound side is already closed.
    StreamClosed { stream_id: u32, state: StreamState },
    /// A control frame tried to open a stream with an id the peer may not use:
    /// this side's parity, or not above the last id the peer opened.
    InvalidStreamId { stream_id: u32 },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownStream { stream_id } => {
                write!(f, "stream {stream_id} has not been created")
            }
            Self::StreamClosed { stream_id, state } => {
                write!(f, "stream {stream_id} cannot receive in state {state}")
            }
            Self::InvalidStreamId { stream_id } => {
                write!(f, "peer may not open stream {stream_id}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Session-level errors.
#[derive(Debug, Clone)]
pub enum SessionError {
    Protocol(ProtocolError),
    Transport(TransportError),
    /// Internal bookkeeping found an impossible state, e.g. a second stream
    /// registered under a live id.
    InvariantViolation(String),
    /// The stream's outbound side is already closed.
    StreamNotWritable { stream_id: u32, state: StreamState },
    PayloadTooLarge { len: usize, max: usize },
    /// The pending write queue reached its configured bound.
    ResourceExhausted { queued: usize, max: usize },
    /// Every stream id of this side's parity has been used.
    IdsExhausted,
    /// No tokio runtime to run the writer on: the session was built outside
    /// one without [`SessionBuilder::runtime`](crate::SessionBuilder::runtime),
    /// and the sender is not inside one either.
    NoRuntime,
    /// The session was closed or disconnected.
    Closed,
}

impl SessionError {
    /// Errors that terminate the session when raised by inbound dispatch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Transport(_) | Self::InvariantViolation(_) | Self::Closed
        )
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            Self::StreamNotWritable { stream_id, state } => {
                write!(f, "stream {stream_id} is not writable in state {state}")
            }
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload {len} bytes exceeds max {max}")
            }
            Self::ResourceExhausted { queued, max } => {
                write!(f, "write queue full ({queued} queued, max {max})")
            }
            Self::IdsExhausted => write!(f, "stream ids exhausted"),
            Self::NoRuntime => write!(f, "no tokio runtime to run the session writer"),
            Self::Closed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}
