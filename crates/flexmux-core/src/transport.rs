//! Transport traits.
//!
//! A session writes encoded frames through a [`Transport`] and is fed decoded
//! frames from a [`FrameSource`] by [`Session::run`](crate::Session::run). The
//! two halves are separate so the read loop never contends with writers.

use std::future::Future;

use bytes::Bytes;

use crate::{Frame, TransportError};

/// Ordered byte sink shared by all writers of a session.
///
/// The session never has more than one `write` outstanding.
pub trait Transport: Send + Sync + 'static {
    /// Write one encoded frame. Resolves once the bytes were handed to the
    /// underlying connection.
    fn write(&self, bytes: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the connection. Later writes fail with [`TransportError::Closed`].
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Inbound half: yields decoded frames in arrival order.
pub trait FrameSource: Send + 'static {
    /// `Ok(None)` on clean end of input.
    fn next_frame(&mut self) -> impl Future<Output = Result<Option<Frame>, TransportError>> + Send;
}

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "stream")]
pub mod stream;
