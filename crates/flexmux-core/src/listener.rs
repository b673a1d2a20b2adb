//! Capabilities supplied by the embedder, and the handle listeners get back.

use std::sync::Arc;

use crate::{
    AttributeValue, Attributes, Completion, DisconnectionFrame, Frame, MessageFrame, PingFrame,
    SendFuture, SessionError, Stream,
};

/// Stream attribute holding the [`ContextListener`] to notify when the stream closes.
pub const CONTEXT_LISTENER_KEY: &str = "flexmux.context_listener";

/// Stream attribute holding the context passed to [`ContextListener::close`].
pub const CONTEXT_KEY: &str = "flexmux.context";

/// Receives the frames of one stream.
///
/// Callbacks run on the session's dispatch task and should not block it.
pub trait StreamListener: Send + Sync + 'static {
    fn on_control(&self, stream: &Arc<Stream>, frame: &MessageFrame);

    fn on_data(&self, stream: &Arc<Stream>, frame: &MessageFrame);
}

/// Session-wide events.
pub trait SessionListener: Send + Sync + 'static {
    /// The peer opened `stream` with `frame`. Returns the listener for the
    /// stream's later frames.
    fn on_new_stream(&self, stream: &Arc<Stream>, frame: &MessageFrame)
    -> Arc<dyn StreamListener>;

    /// A reply to one of our pings arrived.
    fn on_ping(&self, _session: &dyn SessionHandle, _frame: &PingFrame) {}

    /// The peer is tearing the session down. The transport is closed right after.
    fn on_disconnect(&self, _session: &dyn SessionHandle, _frame: &DisconnectionFrame) {}

    /// The session aborted: a protocol violation, an invariant violation or a
    /// failed write. Called at most once.
    fn on_failure(&self, _session: &dyn SessionHandle, _error: &SessionError) {}
}

/// Outer-layer cleanup hook, see [`Stream::attach_context`].
pub trait ContextListener: Send + Sync + 'static {
    fn close(&self, context: AttributeValue);
}

/// The object-safe face of a session, as seen by streams and listeners.
pub trait SessionHandle: Send + Sync + 'static {
    fn session_id(&self) -> u64;

    /// Enqueue `frame`; `completion` runs once it is written or has failed.
    fn send_frame_with(&self, frame: Frame, completion: Completion);

    fn send_frame(&self, frame: Frame) -> SendFuture {
        let (fut, completion) = SendFuture::channel();
        self.send_frame_with(frame, completion);
        fut
    }

    fn attributes(&self) -> &Attributes;

    fn get_stream(&self, stream_id: u32) -> Option<Arc<Stream>>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}
