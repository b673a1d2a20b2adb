//! Single-writer bookkeeping for outbound frames.
//!
//! The scheduler only decides; it never performs I/O. Whoever receives a
//! [`Submit::WriteNow`] owns the writer until [`WriteScheduler::next_after_success`]
//! returns `None` or [`WriteScheduler::fail`] is called, and drives the writes in
//! a loop. The lock is held for the decision alone, never across a write.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::{Completion, Frame, SessionError};

/// A frame waiting to be written, with the completion to run afterwards.
pub struct PendingWrite {
    pub frame: Frame,
    pub completion: Completion,
}

impl std::fmt::Debug for PendingWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWrite")
            .field("frame", &self.frame)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`WriteScheduler::submit`].
#[derive(Debug)]
pub enum Submit {
    /// The writer was idle: the caller now owns it and must write this frame.
    WriteNow(PendingWrite),
    /// A write is in flight; the frame waits at position `depth` of the queue.
    Queued { depth: usize },
    /// The frame was not accepted; its completion has not run.
    Rejected(PendingWrite, SessionError),
}

#[derive(Default)]
struct QueueState {
    writing: bool,
    closed: Option<SessionError>,
    queue: VecDeque<PendingWrite>,
}

/// FIFO of outbound frames behind at most one in-flight write.
pub struct WriteScheduler {
    state: Mutex<QueueState>,
    max_pending: Option<usize>,
}

impl WriteScheduler {
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_pending,
        }
    }

    pub fn submit(&self, write: PendingWrite) -> Submit {
        let mut state = self.state.lock();
        if let Some(err) = &state.closed {
            return Submit::Rejected(write, err.clone());
        }
        if !state.writing {
            state.writing = true;
            return Submit::WriteNow(write);
        }
        if let Some(max) = self.max_pending {
            let queued = state.queue.len();
            if queued >= max {
                return Submit::Rejected(write, SessionError::ResourceExhausted { queued, max });
            }
        }
        state.queue.push_back(write);
        Submit::Queued {
            depth: state.queue.len(),
        }
    }

    /// The in-flight write succeeded: hand out the next one, or go idle.
    pub fn next_after_success(&self) -> Option<PendingWrite> {
        let mut state = self.state.lock();
        let next = state.queue.pop_front();
        if next.is_none() {
            state.writing = false;
        }
        next
    }

    /// Stop for good. Returns the writes that will never be attempted so the
    /// caller can fail them. Only the first call's error is remembered.
    pub fn fail(&self, err: SessionError) -> Vec<PendingWrite> {
        let mut state = self.state.lock();
        state.writing = false;
        state.closed.get_or_insert(err);
        state.queue.drain(..).collect()
    }

    pub fn is_writing(&self) -> bool {
        self.state.lock().writing
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }
}

impl std::fmt::Debug for WriteScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WriteScheduler")
            .field("writing", &state.writing)
            .field("queued", &state.queue.len())
            .field("closed", &state.closed.is_some())
            .field("max_pending", &self.max_pending)
            .finish()
    }
}
