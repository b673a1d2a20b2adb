//! Stream handles and the half-close state machine.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::{
    AttributeValue, Attributes, CONTEXT_KEY, CONTEXT_LISTENER_KEY, ContextListener, Frame,
    MessageFrame, ProtocolError, SendFuture, SessionError, SessionHandle, StreamListener,
};

/// Lifecycle of a stream.
///
/// `Closed` is only ever observed momentarily: a stream reaching it is removed
/// from its session straight away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// This side sent end-of-stream; the peer may still send.
    LocallyClosed,
    /// The peer sent end-of-stream; this side may still send.
    RemotelyClosed,
    Closed,
}

impl StreamState {
    /// State of a stream this side opens with a control frame carrying `end_stream`.
    pub fn initial_local(end_stream: bool) -> Self {
        if end_stream {
            StreamState::LocallyClosed
        } else {
            StreamState::Open
        }
    }

    /// State of a stream the peer opens with a control frame carrying `end_stream`.
    pub fn initial_remote(end_stream: bool) -> Self {
        if end_stream {
            StreamState::RemotelyClosed
        } else {
            StreamState::Open
        }
    }

    /// State after receiving a frame. `None` means the frame is not allowed:
    /// the peer already ended its side.
    pub fn after_recv(self, end_stream: bool) -> Option<Self> {
        match (self, end_stream) {
            (StreamState::Open, false) => Some(StreamState::Open),
            (StreamState::Open, true) => Some(StreamState::RemotelyClosed),
            (StreamState::LocallyClosed, false) => Some(StreamState::LocallyClosed),
            (StreamState::LocallyClosed, true) => Some(StreamState::Closed),
            (StreamState::RemotelyClosed | StreamState::Closed, _) => None,
        }
    }

    /// State after a frame was written.
    pub fn after_send(self, end_stream: bool) -> Self {
        match (self, end_stream) {
            (StreamState::Open, true) => StreamState::LocallyClosed,
            (StreamState::RemotelyClosed, true) => StreamState::Closed,
            (state, _) => state,
        }
    }

    pub fn can_send(self) -> bool {
        matches!(self, StreamState::Open | StreamState::RemotelyClosed)
    }

    pub fn can_recv(self) -> bool {
        matches!(self, StreamState::Open | StreamState::LocallyClosed)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamState::Open => "OPEN",
            StreamState::LocallyClosed => "LOCALLY_CLOSED",
            StreamState::RemotelyClosed => "REMOTELY_CLOSED",
            StreamState::Closed => "CLOSED",
        })
    }
}

/// Attribute value wrapping the listener stored under [`CONTEXT_LISTENER_KEY`].
#[derive(Clone)]
pub struct ContextListenerRef(pub Arc<dyn ContextListener>);

/// What an inbound frame does to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recv {
    /// State already updated; deliver and carry on.
    Deliver,
    /// Final frame: deliver, then close and remove the stream.
    DeliverAndClose,
}

/// One logical channel within a session.
pub struct Stream {
    id: u32,
    local: bool,
    state: Mutex<StreamState>,
    listener: RwLock<Option<Arc<dyn StreamListener>>>,
    attributes: Attributes,
    session: Weak<dyn SessionHandle>,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        local: bool,
        state: StreamState,
        listener: Option<Arc<dyn StreamListener>>,
        session: Weak<dyn SessionHandle>,
    ) -> Self {
        Self {
            id,
            local,
            state: Mutex::new(state),
            listener: RwLock::new(listener),
            attributes: Attributes::new(),
            session,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether this side opened the stream.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn listener(&self) -> Option<Arc<dyn StreamListener>> {
        self.listener.read().clone()
    }

    pub fn set_listener(&self, listener: Arc<dyn StreamListener>) {
        *self.listener.write() = Some(listener);
    }

    /// The owning session, unless it has been dropped.
    pub fn session(&self) -> Option<Arc<dyn SessionHandle>> {
        self.session.upgrade()
    }

    /// Send a control frame on this stream.
    pub fn send_control(&self, payload: impl Into<Bytes>, end_stream: bool) -> SendFuture {
        let frame = MessageFrame::new(self.id, payload).with_end_stream(end_stream);
        self.send(Frame::Control(frame))
    }

    /// Send a complete data message on this stream.
    pub fn send_data(&self, payload: impl Into<Bytes>, end_stream: bool) -> SendFuture {
        let frame = MessageFrame::new(self.id, payload).with_end_stream(end_stream);
        self.send(Frame::Data(frame))
    }

    /// Send a data frame with explicit flags, e.g. one fragment of a message.
    /// The stream id is overwritten with this stream's.
    pub fn send_data_frame(&self, mut frame: MessageFrame) -> SendFuture {
        frame.stream_id = self.id;
        self.send(Frame::Data(frame))
    }

    fn send(&self, frame: Frame) -> SendFuture {
        let state = self.state();
        if !state.can_send() {
            return SendFuture::ready(Err(SessionError::StreamNotWritable {
                stream_id: self.id,
                state,
            }));
        }
        match self.session.upgrade() {
            Some(session) => session.send_frame(frame),
            None => SendFuture::ready(Err(SessionError::Closed)),
        }
    }

    /// Register an outer-layer context to be released when the stream closes.
    ///
    /// `listener.close(context)` runs exactly once, right after the stream is
    /// removed from its session.
    pub fn attach_context(&self, listener: Arc<dyn ContextListener>, context: AttributeValue) {
        self.attributes
            .set(CONTEXT_LISTENER_KEY, Arc::new(ContextListenerRef(listener)));
        self.attributes.set(CONTEXT_KEY, context);
    }

    /// Apply an inbound frame's end-of-stream flag.
    ///
    /// The closing transition is left to [`Stream::mark_closed`] so the final
    /// frame can be delivered first.
    pub(crate) fn begin_recv(&self, end_stream: bool) -> Result<Recv, ProtocolError> {
        let mut state = self.state.lock();
        match state.after_recv(end_stream) {
            None => Err(ProtocolError::StreamClosed {
                stream_id: self.id,
                state: *state,
            }),
            Some(StreamState::Closed) => Ok(Recv::DeliverAndClose),
            Some(next) => {
                *state = next;
                Ok(Recv::Deliver)
            }
        }
    }

    /// Apply a written frame's end-of-stream flag and return `(before, after)`.
    pub(crate) fn apply_send(&self, end_stream: bool) -> (StreamState, StreamState) {
        let mut state = self.state.lock();
        let before = *state;
        *state = before.after_send(end_stream);
        (before, *state)
    }

    pub(crate) fn mark_closed(&self) {
        *self.state.lock() = StreamState::Closed;
    }

    pub(crate) fn deliver_control(self: &Arc<Self>, frame: &MessageFrame) {
        match self.listener() {
            Some(listener) => listener.on_control(self, frame),
            None => tracing::warn!(stream_id = self.id, "control frame dropped: stream has no listener"),
        }
    }

    pub(crate) fn deliver_data(self: &Arc<Self>, frame: &MessageFrame) {
        match self.listener() {
            Some(listener) => listener.on_data(self, frame),
            None => tracing::warn!(stream_id = self.id, "data frame dropped: stream has no listener"),
        }
    }

    /// Run the context close hook, if one was attached. Later calls do nothing.
    pub(crate) fn notify_closed(&self) {
        let listener = self.attributes.remove(CONTEXT_LISTENER_KEY);
        let context = self.attributes.remove(CONTEXT_KEY);
        let (Some(listener), Some(context)) = (listener, context) else {
            return;
        };
        match listener.downcast::<ContextListenerRef>() {
            Ok(listener) => listener.0.close(context),
            Err(_) => tracing::warn!(
                stream_id = self.id,
                "attribute {CONTEXT_LISTENER_KEY} does not hold a context listener"
            ),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("state", &self.state())
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Completion, Frame};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Detached;

    impl SessionHandle for Detached {
        fn session_id(&self) -> u64 {
            0
        }
        fn send_frame_with(&self, _frame: Frame, completion: Completion) {
            completion(Err(SessionError::Closed));
        }
        fn attributes(&self) -> &Attributes {
            unreachable!()
        }
        fn get_stream(&self, _stream_id: u32) -> Option<Arc<Stream>> {
            None
        }
        fn close(&self) {}
        fn is_closed(&self) -> bool {
            true
        }
    }

    fn detached(state: StreamState) -> Arc<Stream> {
        let session: Weak<dyn SessionHandle> = Weak::<Detached>::new();
        Arc::new(Stream::new(1, true, state, None, session))
    }

    #[test]
    fn transition_table() {
        use StreamState::*;
        assert_eq!(Open.after_send(true), LocallyClosed);
        assert_eq!(Open.after_recv(true), Some(RemotelyClosed));
        assert_eq!(LocallyClosed.after_recv(true), Some(Closed));
        assert_eq!(LocallyClosed.after_recv(false), Some(LocallyClosed));
        assert_eq!(RemotelyClosed.after_send(true), Closed);
        assert_eq!(RemotelyClosed.after_send(false), RemotelyClosed);
        assert_eq!(Open.after_send(false), Open);
        assert_eq!(Open.after_recv(false), Some(Open));
        assert_eq!(RemotelyClosed.after_recv(false), None);
        assert_eq!(Closed.after_recv(false), None);
    }

    #[test]
    fn begin_recv_defers_the_closing_flip() {
        let stream = detached(StreamState::LocallyClosed);
        assert_eq!(stream.begin_recv(true), Ok(Recv::DeliverAndClose));
        assert_eq!(stream.state(), StreamState::LocallyClosed);
        stream.mark_closed();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn begin_recv_rejects_frames_after_remote_end() {
        let stream = detached(StreamState::Open);
        assert_eq!(stream.begin_recv(true), Ok(Recv::Deliver));
        assert_eq!(stream.state(), StreamState::RemotelyClosed);
        assert_eq!(
            stream.begin_recv(false),
            Err(ProtocolError::StreamClosed {
                stream_id: 1,
                state: StreamState::RemotelyClosed
            })
        );
    }

    #[tokio::test]
    async fn send_on_locally_closed_stream_is_rejected() {
        let stream = detached(StreamState::LocallyClosed);
        let err = stream.send_data("late", false).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::StreamNotWritable {
                stream_id: 1,
                state: StreamState::LocallyClosed
            }
        ));
    }

    #[tokio::test]
    async fn send_without_session_reports_closed() {
        let stream = detached(StreamState::Open);
        let err = stream.send_control("hello", false).await.unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }

    struct CountingContext(AtomicUsize);

    impl ContextListener for CountingContext {
        fn close(&self, context: AttributeValue) {
            assert_eq!(context.downcast_ref::<&'static str>(), Some(&"ctx"));
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn context_close_hook_runs_once() {
        let stream = detached(StreamState::Open);
        let hook = Arc::new(CountingContext(AtomicUsize::new(0)));
        stream.attach_context(hook.clone(), Arc::new("ctx"));
        stream.notify_closed();
        stream.notify_closed();
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
        assert!(stream.attributes().get(CONTEXT_KEY).is_none());
    }

    #[test]
    fn close_hook_needs_both_attributes() {
        let stream = detached(StreamState::Open);
        let hook = Arc::new(CountingContext(AtomicUsize::new(0)));
        stream
            .attributes()
            .set(CONTEXT_LISTENER_KEY, Arc::new(ContextListenerRef(hook.clone())));
        stream.notify_closed();
        assert_eq!(hook.0.load(Ordering::SeqCst), 0);
    }

    #[derive(Debug, Clone, Copy)]
    enum Event {
        Send(bool),
        Recv(bool),
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![any::<bool>().prop_map(Event::Send), any::<bool>().prop_map(Event::Recv)]
    }

    proptest! {
        /// The state always reflects which directions have ended, and nothing is
        /// accepted once the peer has ended its side.
        #[test]
        fn state_tracks_both_half_closes(
            local in any::<bool>(),
            first_end in any::<bool>(),
            events in proptest::collection::vec(event(), 0..32),
        ) {
            let mut state = if local {
                StreamState::initial_local(first_end)
            } else {
                StreamState::initial_remote(first_end)
            };
            let mut sent_end = local && first_end;
            let mut recv_end = !local && first_end;

            for ev in events {
                if state == StreamState::Closed {
                    break;
                }
                match ev {
                    Event::Send(end) => {
                        state = state.after_send(end);
                        sent_end |= end;
                    }
                    Event::Recv(end) => match state.after_recv(end) {
                        Some(next) => {
                            prop_assert!(!recv_end);
                            state = next;
                            recv_end |= end;
                        }
                        None => {
                            prop_assert!(recv_end);
                            break;
                        }
                    },
                }
                let expected = match (sent_end, recv_end) {
                    (false, false) => StreamState::Open,
                    (true, false) => StreamState::LocallyClosed,
                    (false, true) => StreamState::RemotelyClosed,
                    (true, true) => StreamState::Closed,
                };
                prop_assert_eq!(state, expected);
            }
        }
    }
}
