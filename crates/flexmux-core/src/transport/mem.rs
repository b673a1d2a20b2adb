//! In-process transport pair.
//!
//! Bytes written on one side come out of the other side's [`MemFrameSource`],
//! going through the codec both ways like a real connection would.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{DecodeError, FlexCodec, Frame, FrameCodec, FrameSource, Transport, TransportError};

const CHANNEL_CAPACITY: usize = 64;

/// Writing half of an in-memory connection.
#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    /// Dropped on close so the peer's source sees end of input.
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    closed: AtomicBool,
}

/// Reading half of an in-memory connection.
pub struct MemFrameSource {
    rx: mpsc::Receiver<Bytes>,
    buf: BytesMut,
    codec: Arc<dyn FrameCodec>,
}

impl std::fmt::Debug for MemFrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemFrameSource")
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

/// One end of a connection: where to write, and where frames arrive.
pub type MemEnd = (MemTransport, MemFrameSource);

/// Two connected ends using [`FlexCodec`].
pub fn pair() -> (MemEnd, MemEnd) {
    pair_with_codec(Arc::new(FlexCodec::new()))
}

pub fn pair_with_codec(codec: Arc<dyn FrameCodec>) -> (MemEnd, MemEnd) {
    let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
    let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);
    (
        (MemTransport::new(tx_b), MemFrameSource::new(rx_a, codec.clone())),
        (MemTransport::new(tx_a), MemFrameSource::new(rx_b, codec)),
    )
}

impl MemTransport {
    fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            inner: Arc::new(MemInner {
                tx: Mutex::new(Some(tx)),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl Transport for MemTransport {
    async fn write(&self, bytes: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let tx = self.inner.tx.lock().clone().ok_or(TransportError::Closed)?;
        tx.send(bytes).await.map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl MemFrameSource {
    fn new(rx: mpsc::Receiver<Bytes>, codec: Arc<dyn FrameCodec>) -> Self {
        Self {
            rx,
            buf: BytesMut::new(),
            codec,
        }
    }
}

impl FrameSource for MemFrameSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            match self.rx.recv().await {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None if self.buf.is_empty() => return Ok(None),
                None => {
                    return Err(DecodeError::Truncated {
                        buffered: self.buf.len(),
                    }
                    .into());
                }
            }
        }
    }
}
