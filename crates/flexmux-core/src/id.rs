//! Stream id allocation.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::{MAX_STREAM_ID, ProtocolError, SessionError};

/// Hands out local stream ids and vets ids the peer opens.
///
/// Local ids start at the configured value and step by 2, so they keep the
/// parity of the start value. The peer owns the other parity.
#[derive(Debug)]
pub struct IdAllocator {
    next_local: AtomicU32,
    local_parity: u32,
    /// Lowest id the peer may open next.
    next_remote: AtomicU32,
}

impl IdAllocator {
    pub fn new(initial_stream_id: u32) -> Self {
        Self {
            next_local: AtomicU32::new(initial_stream_id),
            local_parity: initial_stream_id % 2,
            next_remote: AtomicU32::new(0),
        }
    }

    /// Draw the next local id.
    pub fn next_id(&self) -> Result<u32, SessionError> {
        self.next_local
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                (id <= MAX_STREAM_ID).then(|| id + 2)
            })
            .map_err(|_| SessionError::IdsExhausted)
    }

    /// Whether `id` has this side's parity.
    pub fn is_local(&self, id: u32) -> bool {
        id % 2 == self.local_parity
    }

    /// Accept `id` as a new peer-opened stream.
    ///
    /// Rejects ids of this side's parity and ids that do not exceed the last one
    /// accepted, since ids are never reused.
    pub fn accept_remote(&self, id: u32) -> Result<(), ProtocolError> {
        if id > MAX_STREAM_ID || self.is_local(id) {
            return Err(ProtocolError::InvalidStreamId { stream_id: id });
        }
        self.next_remote
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                if id >= next { id.checked_add(1) } else { None }
            })
            .map(|_| ())
            .map_err(|_| ProtocolError::InvalidStreamId { stream_id: id })
    }
}
