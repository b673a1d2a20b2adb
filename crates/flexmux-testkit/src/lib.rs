//! flexmux-testkit: test doubles for exercising flexmux sessions.
//!
//! - [`RecordingTransport`] records every write, tracks how many writes are in
//!   flight at once, and can hold writes behind a gate or fail them.
//! - [`RecordingStreamListener`], [`RecordingSessionListener`] and
//!   [`CountingContextListener`] record what a session delivers.
//! - [`control`] / [`data`] build message frames.
//!
//! # Usage
//!
//! ```ignore
//! let transport = RecordingTransport::gated();
//! let session = Session::new(transport.clone(), SessionConfig::new(Role::Client));
//! let _ = session.ping();
//! let frames = transport.wait_for_writes(1).await;
//! transport.release(1);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use flexmux_core::{
    AttributeValue, ContextListener, DisconnectionFrame, FlexCodec, Frame, FrameCodec,
    MessageFrame, PingFrame, SessionError, SessionHandle, SessionListener, Stream, StreamListener,
    StreamState, Transport, TransportError,
};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

/// How long the `wait_*` helpers wait before panicking.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A control frame for `stream_id`.
pub fn control(stream_id: u32, payload: &'static str, end_stream: bool) -> Frame {
    Frame::Control(MessageFrame::new(stream_id, payload).with_end_stream(end_stream))
}

/// A data frame for `stream_id`.
pub fn data(stream_id: u32, payload: &'static str, end_stream: bool) -> Frame {
    Frame::Data(MessageFrame::new(stream_id, payload).with_end_stream(end_stream))
}

/// Poll `condition` until it holds, panicking after [`WAIT_TIMEOUT`].
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Transport double that records writes.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<RecordingInner>,
}

#[derive(Default)]
struct RecordingInner {
    written: Mutex<Vec<Bytes>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// When set, each write waits for one permit before completing.
    gate: Option<Semaphore>,
    failure: Mutex<Option<TransportError>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    written_notify: Notify,
}

impl RecordingTransport {
    /// Writes complete immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes are recorded immediately but only complete once [`release`](Self::release)d.
    pub fn gated() -> Self {
        Self {
            inner: Arc::new(RecordingInner {
                gate: Some(Semaphore::new(0)),
                ..Default::default()
            }),
        }
    }

    /// Let `n` held writes complete.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.inner.gate {
            gate.add_permits(n);
        }
    }

    /// Fail every write from now on with `err`.
    pub fn fail_writes(&self, err: TransportError) {
        *self.inner.failure.lock() = Some(err);
    }

    pub fn write_count(&self) -> usize {
        self.inner.written.lock().len()
    }

    /// Raw bytes of every write attempted, in order.
    pub fn written(&self) -> Vec<Bytes> {
        self.inner.written.lock().clone()
    }

    /// Every write attempted, decoded.
    pub fn frames(&self) -> Vec<Frame> {
        let codec = FlexCodec::new();
        let mut buf = BytesMut::new();
        for chunk in self.written() {
            buf.extend_from_slice(&chunk);
        }
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = codec.decode(&mut buf) {
            frames.push(frame);
        }
        frames
    }

    /// Highest number of writes observed in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` writes were attempted, then return them decoded.
    pub async fn wait_for_writes(&self, n: usize) -> Vec<Frame> {
        let result = tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                let notified = self.inner.written_notify.notified();
                if self.write_count() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "timed out waiting for {n} writes, saw {}",
            self.write_count()
        );
        self.frames()
    }
}

impl Transport for RecordingTransport {
    async fn write(&self, bytes: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.inner.written.lock().push(bytes);
        self.inner.written_notify.notify_waiters();

        let gated = match &self.inner.gate {
            Some(gate) => gate.acquire().await.map(|permit| permit.forget()),
            None => Ok(()),
        };
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);

        if gated.is_err() {
            return Err(TransportError::Closed);
        }
        if let Some(err) = self.inner.failure.lock().clone() {
            return Err(err);
        }
        Ok(())
    }

    fn close(&self) {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(gate) = &self.inner.gate {
            gate.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// A frame seen by a [`RecordingStreamListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub stream_id: u32,
    pub control: bool,
    pub frame: MessageFrame,
    /// Stream state at the time of delivery.
    pub state: StreamState,
}

#[derive(Default)]
pub struct RecordingStreamListener {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingStreamListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.deliveries
            .lock()
            .iter()
            .map(|d| d.frame.payload.clone())
            .collect()
    }

    fn record(&self, stream: &Arc<Stream>, frame: &MessageFrame, control: bool) {
        self.deliveries.lock().push(Delivery {
            stream_id: stream.id(),
            control,
            frame: frame.clone(),
            state: stream.state(),
        });
    }
}

impl StreamListener for RecordingStreamListener {
    fn on_control(&self, stream: &Arc<Stream>, frame: &MessageFrame) {
        self.record(stream, frame, true);
    }

    fn on_data(&self, stream: &Arc<Stream>, frame: &MessageFrame) {
        self.record(stream, frame, false);
    }
}

/// Hands every new remote stream the same [`RecordingStreamListener`] and
/// records session events.
pub struct RecordingSessionListener {
    pub streams: Arc<RecordingStreamListener>,
    opened: Mutex<Vec<(u32, MessageFrame)>>,
    ping_replies: AtomicUsize,
    disconnects: Mutex<Vec<DisconnectionFrame>>,
    failures: Mutex<Vec<SessionError>>,
}

impl RecordingSessionListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: RecordingStreamListener::new(),
            opened: Mutex::new(Vec::new()),
            ping_replies: AtomicUsize::new(0),
            disconnects: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        })
    }

    /// `(stream id, opening frame)` of each remote stream, in order.
    pub fn opened(&self) -> Vec<(u32, MessageFrame)> {
        self.opened.lock().clone()
    }

    pub fn ping_replies(&self) -> usize {
        self.ping_replies.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> Vec<DisconnectionFrame> {
        self.disconnects.lock().clone()
    }

    pub fn failures(&self) -> Vec<SessionError> {
        self.failures.lock().clone()
    }
}

impl SessionListener for RecordingSessionListener {
    fn on_new_stream(
        &self,
        stream: &Arc<Stream>,
        frame: &MessageFrame,
    ) -> Arc<dyn StreamListener> {
        self.opened.lock().push((stream.id(), frame.clone()));
        self.streams.clone()
    }

    fn on_ping(&self, _session: &dyn SessionHandle, _frame: &PingFrame) {
        self.ping_replies.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnect(&self, _session: &dyn SessionHandle, frame: &DisconnectionFrame) {
        self.disconnects.lock().push(frame.clone());
    }

    fn on_failure(&self, _session: &dyn SessionHandle, error: &SessionError) {
        self.failures.lock().push(error.clone());
    }
}

/// Counts close hooks and keeps the contexts it was handed.
#[derive(Default)]
pub struct CountingContextListener {
    closed: Mutex<Vec<AttributeValue>>,
}

impl CountingContextListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn close_count(&self) -> usize {
        self.closed.lock().len()
    }

    /// Closed contexts that are `T`, in close order.
    pub fn closed_as<T: Clone + Send + Sync + 'static>(&self) -> Vec<T> {
        self.closed
            .lock()
            .iter()
            .filter_map(|c| c.downcast_ref::<T>().cloned())
            .collect()
    }
}

impl ContextListener for CountingContextListener {
    fn close(&self, context: AttributeValue) {
        tracing::trace!("context closed");
        self.closed.lock().push(context);
    }
}
