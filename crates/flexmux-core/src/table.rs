//! Live streams of one session.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::Stream;

/// Map from stream id to stream. Holds exactly the streams that are not closed.
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: Mutex<HashMap<u32, Arc<Stream>>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream_id: u32) -> Option<Arc<Stream>> {
        self.streams.lock().get(&stream_id).cloned()
    }

    /// Insert unless the id is taken; on conflict the live stream is returned.
    pub fn insert_new(&self, stream: Arc<Stream>) -> Result<(), Arc<Stream>> {
        use std::collections::hash_map::Entry;
        match self.streams.lock().entry(stream.id()) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(stream);
                Ok(())
            }
        }
    }

    pub fn remove(&self, stream_id: u32) -> Option<Arc<Stream>> {
        self.streams.lock().remove(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.streams.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// All live streams, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<Stream>> {
        let mut streams: Vec<Arc<Stream>> = self.streams.lock().values().cloned().collect();
        streams.sort_unstable_by_key(|s| s.id());
        streams
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Stream>> {
        self.streams.lock().drain().map(|(_, s)| s).collect()
    }
}
