//! Transport over tokio byte streams (TCP, Unix sockets, duplex pipes, ...).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::{DecodeError, FlexCodec, Frame, FrameCodec, FrameSource, Transport, TransportError};

const READ_CHUNK: usize = 8 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send + Sync>;

/// Writing half of a byte stream.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    writer: AsyncMutex<BoxedWriter>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl StreamTransport {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(StreamInner {
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl Transport for StreamTransport {
    async fn write(&self, bytes: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Marks the transport closed and shuts the write side down in the
    /// background, so the peer reads end of input.
    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.writer.lock().await.shutdown().await {
                        tracing::debug!(error = %e, "stream shutdown failed");
                    }
                });
            }
            Err(_) => tracing::debug!("no runtime to shut the stream down; relying on drop"),
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Reading half of a byte stream, decoding frames as they complete.
pub struct StreamFrameSource<R> {
    reader: R,
    buf: BytesMut,
    codec: Arc<dyn FrameCodec>,
}

impl<R> std::fmt::Debug for StreamFrameSource<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamFrameSource")
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

impl<R> StreamFrameSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(reader: R, codec: Arc<dyn FrameCodec>) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            codec,
        }
    }
}

impl<R> FrameSource for StreamFrameSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            self.buf.reserve(READ_CHUNK);
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(DecodeError::Truncated {
                    buffered: self.buf.len(),
                }
                .into());
            }
        }
    }
}

/// Split a bidirectional stream into a transport and a frame source.
pub fn split<S>(
    io: S,
    codec: Arc<dyn FrameCodec>,
) -> (StreamTransport, StreamFrameSource<tokio::io::ReadHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let (reader, writer) = tokio::io::split(io);
    (
        StreamTransport::new(writer),
        StreamFrameSource::new(reader, codec),
    )
}

/// Two connected ends over an in-process duplex pipe, using [`FlexCodec`].
pub fn pair() -> (
    (StreamTransport, StreamFrameSource<tokio::io::ReadHalf<tokio::io::DuplexStream>>),
    (StreamTransport, StreamFrameSource<tokio::io::ReadHalf<tokio::io::DuplexStream>>),
) {
    let codec: Arc<dyn FrameCodec> = Arc::new(FlexCodec::new());
    let (a, b) = tokio::io::duplex(64 * 1024);
    (split(a, codec.clone()), split(b, codec))
}
