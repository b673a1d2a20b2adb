//! The session: inbound dispatch, stream bookkeeping and the outbound writer.
//!
//! ```text
//!   FrameSource ──► run() ──► dispatch(frame)
//!                               │
//!        ┌──────────────┬───────┴──────┬─────────────────┐
//!     Control          Data           Ping          Disconnection
//!   new id? open     route to       request: reply   on_disconnect,
//!   remote stream    the stream     reply: on_ping   close
//!
//!   send_frame ──► WriteScheduler ──► drain task ──► Transport::write
//!                  (one in flight,     (iterative:     on success: apply
//!                   FIFO queue)         write, pop)    half-close, complete
//! ```
//!
//! Every write goes through one scheduler, so at most one frame is on the
//! transport at a time and completions run in enqueue order. The task that
//! finds the writer idle spawns a drain task which keeps writing until the
//! queue is empty. No lock is held across a write.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::scheduler::{PendingWrite, Submit};
use crate::stream::Recv;
use crate::{
    Attributes, Completion, CountingCompletion, DisconnectionFrame, FlexCodec, Frame, FrameCodec,
    FrameSource, IdAllocator, MessageFrame, PingFrame, ProtocolError, SendFuture, SessionConfig,
    SessionError, SessionHandle, SessionListener, Stream, StreamListener, StreamState,
    StreamTable, Transport, TransportError, WriteScheduler,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Builder for a [`Session`] with a listener, codec or span set up front.
pub struct SessionBuilder {
    config: SessionConfig,
    listener: Option<Arc<dyn SessionListener>>,
    codec: Option<Arc<dyn FrameCodec>>,
    span: Option<tracing::Span>,
    runtime: Option<Handle>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            listener: None,
            codec: None,
            span: None,
            runtime: None,
        }
    }

    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Codec used to encode outbound frames. Defaults to [`FlexCodec`] limited
    /// to the configured `max_frame_payload`.
    pub fn codec(mut self, codec: Arc<dyn FrameCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Span every event of the session is recorded under. Defaults to
    /// `flexmux_session{session_id}`.
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Runtime the writer task is spawned on. Defaults to the runtime `build`
    /// is called from, if any, so sends work from threads outside it.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build<T: Transport>(self, transport: T) -> Arc<Session<T>> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let codec = self
            .codec
            .unwrap_or_else(|| Arc::new(FlexCodec::with_max_payload(self.config.max_frame_payload)));
        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("flexmux_session", session_id = id));
        let runtime = self.runtime.or_else(|| Handle::try_current().ok());
        let (closed, _) = watch::channel(false);

        Arc::new_cyclic(|this| Session {
            this: this.clone(),
            id,
            ids: IdAllocator::new(self.config.initial_stream_id),
            scheduler: WriteScheduler::new(self.config.max_pending_writes),
            config: self.config,
            transport,
            codec,
            streams: StreamTable::new(),
            open_lock: Mutex::new(()),
            listener: RwLock::new(self.listener),
            attributes: Attributes::new(),
            span,
            runtime,
            closed,
        })
    }
}

/// All streams of one connection, and the serialization of writes onto it.
pub struct Session<T: Transport> {
    this: Weak<Self>,
    id: u64,
    config: SessionConfig,
    transport: T,
    codec: Arc<dyn FrameCodec>,
    streams: StreamTable,
    ids: IdAllocator,
    scheduler: WriteScheduler,
    /// Held from id draw to enqueue, so local ids reach the wire in order.
    open_lock: Mutex<()>,
    listener: RwLock<Option<Arc<dyn SessionListener>>>,
    attributes: Attributes,
    span: tracing::Span,
    runtime: Option<Handle>,
    closed: watch::Sender<bool>,
}

impl<T: Transport> Session<T> {
    /// A session without a listener; see [`SessionBuilder`] for more options.
    pub fn new(transport: T, config: SessionConfig) -> Arc<Self> {
        SessionBuilder::new(config).build(transport)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn listener(&self) -> Option<Arc<dyn SessionListener>> {
        self.listener.read().clone()
    }

    /// Replace the session listener. Remote streams opened before this keep
    /// the stream listener they were given.
    pub fn set_listener(&self, listener: Arc<dyn SessionListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn get_stream(&self, stream_id: u32) -> Option<Arc<Stream>> {
        self.streams.get(stream_id)
    }

    /// Live streams, ordered by id.
    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.streams.snapshot()
    }

    pub fn stream_ids(&self) -> Vec<u32> {
        self.streams.ids()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Writes waiting behind the one in flight.
    pub fn pending_writes(&self) -> usize {
        self.scheduler.queued_len()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn handle(&self) -> Weak<dyn SessionHandle> {
        self.this.clone()
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    /// Route one inbound frame.
    ///
    /// Must not be called concurrently for the same session. Any error aborts
    /// the session before it is returned.
    pub fn dispatch(&self, frame: Frame) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let result = match frame {
            Frame::Control(m) => self.on_control(m),
            Frame::Data(m) => self.on_data(m),
            Frame::Ping(ping) => {
                self.on_ping(ping);
                Ok(())
            }
            Frame::Disconnection(frame) => {
                self.on_disconnection(frame);
                Ok(())
            }
        };
        if let Err(err) = &result {
            self.abort(err.clone());
        }
        result
    }

    fn on_control(&self, frame: MessageFrame) -> Result<(), SessionError> {
        match self.streams.get(frame.stream_id) {
            Some(stream) => self.deliver(&stream, &frame, true),
            None => self.open_remote(frame),
        }
    }

    fn on_data(&self, frame: MessageFrame) -> Result<(), SessionError> {
        let stream = self
            .streams
            .get(frame.stream_id)
            .ok_or(ProtocolError::UnknownStream {
                stream_id: frame.stream_id,
            })?;
        self.deliver(&stream, &frame, false)
    }

    fn open_remote(&self, frame: MessageFrame) -> Result<(), SessionError> {
        let stream_id = frame.stream_id;
        self.ids.accept_remote(stream_id)?;

        let state = StreamState::initial_remote(frame.end_stream);
        let stream = Arc::new(Stream::new(stream_id, false, state, None, self.handle()));
        if self.streams.insert_new(stream.clone()).is_err() {
            return Err(SessionError::InvariantViolation(format!(
                "stream {stream_id} has already been created"
            )));
        }
        tracing::debug!(parent: &self.span, stream_id, %state, "remote stream opened");

        match self.listener() {
            Some(listener) => {
                let stream_listener = listener.on_new_stream(&stream, &frame);
                stream.set_listener(stream_listener);
            }
            None => tracing::warn!(
                parent: &self.span,
                stream_id,
                "no session listener; remote stream frames will be dropped"
            ),
        }
        Ok(())
    }

    fn deliver(
        &self,
        stream: &Arc<Stream>,
        frame: &MessageFrame,
        control: bool,
    ) -> Result<(), SessionError> {
        let recv = stream.begin_recv(frame.end_stream)?;
        tracing::trace!(
            parent: &self.span,
            stream_id = frame.stream_id,
            control,
            end_stream = frame.end_stream,
            payload_len = frame.payload.len(),
            "delivering frame"
        );
        if control {
            stream.deliver_control(frame);
        } else {
            stream.deliver_data(frame);
        }
        if recv == Recv::DeliverAndClose {
            stream.mark_closed();
            self.finish_stream(stream);
        }
        Ok(())
    }

    fn on_ping(&self, ping: PingFrame) {
        if ping.reply {
            tracing::debug!(parent: &self.span, "ping reply received");
            if let Some(listener) = self.listener() {
                listener.on_ping(self, &ping);
            }
            return;
        }
        tracing::debug!(parent: &self.span, "ping request received");
        let span = self.span.clone();
        self.send_frame_with(
            PingFrame::reply().into(),
            Box::new(move |result| {
                if let Err(error) = result {
                    tracing::debug!(parent: &span, %error, "ping reply not sent");
                }
            }),
        );
    }

    fn on_disconnection(&self, frame: DisconnectionFrame) {
        tracing::info!(
            parent: &self.span,
            reason = %String::from_utf8_lossy(&frame.reason),
            "peer disconnected"
        );
        if let Some(listener) = self.listener() {
            listener.on_disconnect(self, &frame);
        }
        self.close();
    }

    /// Remove a stream that reached `Closed` and run its close hook.
    fn finish_stream(&self, stream: &Stream) {
        if self.streams.remove(stream.id()).is_some() {
            tracing::debug!(parent: &self.span, stream_id = stream.id(), "stream closed");
            stream.notify_closed();
        }
    }

    /// Pull frames from `source` and dispatch them until end of input, a
    /// transport error, a dispatch error or the session closing. The session is
    /// closed when this returns.
    pub async fn run<S: FrameSource>(self: Arc<Self>, mut source: S) -> Result<(), SessionError> {
        let mut closed = self.closed.subscribe();
        tracing::debug!(parent: &self.span, "read loop started");
        let result = loop {
            if self.is_closed() {
                break Ok(());
            }
            let next = tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                next = source.next_frame() => next,
            };
            match next {
                Ok(Some(frame)) => {
                    if let Err(err) = self.dispatch(frame) {
                        break Err(err);
                    }
                }
                Ok(None) => {
                    tracing::debug!(parent: &self.span, "end of input");
                    break Ok(());
                }
                Err(TransportError::Closed) => break Ok(()),
                Err(e) => {
                    let err = SessionError::Transport(e);
                    self.abort(err.clone());
                    break Err(err);
                }
            }
        };
        self.close();
        tracing::debug!(parent: &self.span, ok = result.is_ok(), "read loop finished");
        result
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    /// Open a local stream with `frame` as its control frame.
    ///
    /// The stream is registered before the frame is queued; the returned future
    /// resolves once the control frame has been written. `frame.stream_id` is
    /// replaced by the allocated id.
    pub fn new_stream(
        &self,
        frame: MessageFrame,
        listener: Arc<dyn StreamListener>,
    ) -> impl Future<Output = Result<Arc<Stream>, SessionError>> + Send + use<T> {
        let opened = self.open_local(frame, listener);
        let this = self.this.clone();
        async move {
            let (stream, sent) = opened?;
            if let Err(err) = sent.await {
                stream.mark_closed();
                if let Some(session) = this.upgrade() {
                    session.finish_stream(&stream);
                }
                return Err(err);
            }
            Ok(stream)
        }
    }

    fn open_local(
        &self,
        mut frame: MessageFrame,
        listener: Arc<dyn StreamListener>,
    ) -> Result<(Arc<Stream>, SendFuture), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.check_payload(frame.payload.len())?;

        let _order = self.open_lock.lock();
        let stream_id = self.ids.next_id()?;
        let state = StreamState::initial_local(frame.end_stream);
        let stream = Arc::new(Stream::new(
            stream_id,
            true,
            state,
            Some(listener),
            self.handle(),
        ));
        if self.streams.insert_new(stream.clone()).is_err() {
            let err = SessionError::InvariantViolation(format!(
                "local stream {stream_id} has already been created"
            ));
            self.abort(err.clone());
            return Err(err);
        }
        tracing::debug!(parent: &self.span, stream_id, %state, "local stream opened");

        frame.stream_id = stream_id;
        let sent = self.send_frame(Frame::Control(frame));
        Ok((stream, sent))
    }

    /// Send a non-reply ping. Resolves when it is written, not when the reply
    /// arrives; replies go to [`SessionListener::on_ping`].
    pub fn ping(&self) -> SendFuture {
        self.send_frame(PingFrame::request().into())
    }

    /// Send a disconnection frame. The peer closes the connection on receipt.
    pub fn disconnect(&self, frame: DisconnectionFrame) -> SendFuture {
        self.send_frame(frame.into())
    }

    pub fn send_frame(&self, frame: Frame) -> SendFuture {
        let (fut, completion) = SendFuture::channel();
        self.send_frame_with(frame, completion);
        fut
    }

    /// Queue `frame`. On a successful write the frame's end-of-stream flag is
    /// applied to its stream before `completion` runs.
    pub fn send_frame_with(&self, frame: Frame, completion: Completion) {
        if let Err(err) = self.check_payload(frame.payload_len()) {
            completion(Err(err));
            return;
        }
        let completion = self.after_write(&frame, completion);
        self.enqueue(PendingWrite { frame, completion });
    }

    /// Send several frames with one future that resolves once all of them are
    /// written, or on the first failure.
    pub fn send_frames(&self, frames: Vec<Frame>) -> SendFuture {
        let (fut, completion) = SendFuture::channel();
        self.send_frames_with(frames, completion);
        fut
    }

    pub fn send_frames_with(&self, frames: Vec<Frame>, completion: Completion) {
        let Some(counter) = CountingCompletion::new(completion, frames.len()) else {
            return;
        };
        for frame in frames {
            self.send_frame_with(frame, counter.part());
        }
    }

    fn check_payload(&self, len: usize) -> Result<(), SessionError> {
        let max = self.config.max_frame_payload;
        if len > max {
            return Err(SessionError::PayloadTooLarge { len, max });
        }
        Ok(())
    }

    fn after_write(&self, frame: &Frame, completion: Completion) -> Completion {
        let Some(message) = frame.as_message() else {
            return completion;
        };
        if !message.end_stream {
            return completion;
        }
        let stream_id = message.stream_id;
        let this = self.this.clone();
        Box::new(move |result| {
            if result.is_ok() {
                if let Some(session) = this.upgrade() {
                    session.on_end_stream_sent(stream_id);
                }
            }
            completion(result);
        })
    }

    fn on_end_stream_sent(&self, stream_id: u32) {
        let Some(stream) = self.streams.get(stream_id) else {
            tracing::trace!(parent: &self.span, stream_id, "end of stream sent on a removed stream");
            return;
        };
        match stream.apply_send(true) {
            (StreamState::Closed, _) => {}
            (_, StreamState::Closed) => self.finish_stream(&stream),
            (before, after) if before == after => {
                tracing::trace!(parent: &self.span, stream_id, state = %before, "end of stream already sent");
            }
            (_, after) => {
                tracing::debug!(parent: &self.span, stream_id, state = %after, "stream half-closed locally");
            }
        }
    }

    fn enqueue(&self, write: PendingWrite) {
        match self.scheduler.submit(write) {
            Submit::WriteNow(write) => {
                let Some(session) = self.this.upgrade() else {
                    self.terminate(SessionError::Closed, Some(write), false);
                    return;
                };
                match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
                    Some(runtime) => {
                        runtime.spawn(session.drain(write));
                    }
                    None => self.terminate(SessionError::NoRuntime, Some(write), true),
                }
            }
            Submit::Queued { depth } => {
                tracing::trace!(parent: &self.span, queued = depth, "write queued");
            }
            Submit::Rejected(write, err) => {
                tracing::debug!(parent: &self.span, error = %err, "write rejected");
                (write.completion)(Err(err));
            }
        }
    }

    /// Owns the writer: writes `current`, then every write queued behind it.
    async fn drain(self: Arc<Self>, mut current: PendingWrite) {
        loop {
            let bytes = self.codec.encode_to_bytes(&current.frame);
            tracing::trace!(
                parent: &self.span,
                kind = ?current.frame.kind(),
                stream_id = ?current.frame.stream_id(),
                len = bytes.len(),
                "writing frame"
            );
            match self.transport.write(bytes).await {
                Ok(()) => {
                    (current.completion)(Ok(()));
                    match self.scheduler.next_after_success() {
                        Some(next) => current = next,
                        None => return,
                    }
                }
                Err(e) => {
                    let err = SessionError::Transport(e);
                    if !self.is_closed() {
                        tracing::error!(parent: &self.span, error = %err, "frame write failed");
                    }
                    self.terminate(err, Some(current), true);
                    return;
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------------

    /// Close the transport. Queued writes fail with [`SessionError::Closed`],
    /// and every live stream is removed with its close hook run.
    pub fn close(&self) {
        self.terminate(SessionError::Closed, None, false);
    }

    /// Abort after a protocol or invariant violation: like [`Session::close`],
    /// but queued writes fail with `err` and the listener's `on_failure` runs.
    pub fn abort(&self, err: SessionError) {
        self.terminate(err, None, true);
    }

    fn terminate(&self, err: SessionError, in_flight: Option<PendingWrite>, report: bool) {
        let first = !self.closed.send_replace(true);
        let abandoned = self.scheduler.fail(err.clone());

        if first {
            if report {
                tracing::warn!(parent: &self.span, error = %err, "session aborted");
                if let Some(listener) = self.listener() {
                    listener.on_failure(self, &err);
                }
            } else {
                tracing::debug!(parent: &self.span, "session closed");
            }
        }
        self.transport.close();

        if let Some(write) = in_flight {
            (write.completion)(Err(err.clone()));
        }
        if !abandoned.is_empty() {
            tracing::debug!(parent: &self.span, count = abandoned.len(), "failing queued writes");
        }
        for write in abandoned {
            (write.completion)(Err(err.clone()));
        }

        if first {
            for stream in self.streams.drain() {
                stream.mark_closed();
                stream.notify_closed();
            }
        }
    }
}

impl<T: Transport> SessionHandle for Session<T> {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn send_frame_with(&self, frame: Frame, completion: Completion) {
        Session::send_frame_with(self, frame, completion);
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    fn get_stream(&self, stream_id: u32) -> Option<Arc<Stream>> {
        self.streams.get(stream_id)
    }

    fn close(&self) {
        Session::close(self);
    }

    fn is_closed(&self) -> bool {
        Session::is_closed(self)
    }
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("streams", &self.streams.ids())
            .field("scheduler", &self.scheduler)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
