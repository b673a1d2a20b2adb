//! Write completions: callback and future forms.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::SessionError;

/// Callback invoked exactly once with the outcome of a send.
///
/// It runs on whichever task completed the write, not necessarily the caller's.
pub type Completion = Box<dyn FnOnce(Result<(), SessionError>) + Send + 'static>;

/// Future resolving when a send has been written to the transport (or failed).
#[derive(Debug)]
#[must_use = "a SendFuture does nothing unless awaited; drop it to ignore the outcome"]
pub struct SendFuture {
    rx: oneshot::Receiver<Result<(), SessionError>>,
}

impl SendFuture {
    /// A future plus the completion that resolves it.
    pub fn channel() -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let completion: Completion = Box::new(move |result| {
            // The caller may have stopped waiting.
            let _ = tx.send(result);
        });
        (Self { rx }, completion)
    }

    /// An already-resolved future.
    pub fn ready(result: Result<(), SessionError>) -> Self {
        let (fut, completion) = Self::channel();
        completion(result);
        fut
    }
}

impl Future for SendFuture {
    type Output = Result<(), SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped completion means the session went away without reporting.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(SessionError::Closed)))
    }
}

/// Fans one completion out over `count` sends.
///
/// Succeeds once every part succeeded; fails once, on the first failing part.
pub(crate) struct CountingCompletion {
    remaining: AtomicUsize,
    inner: Mutex<Option<Completion>>,
}

impl CountingCompletion {
    /// Returns `None` (after completing `completion` with success) when `count` is 0.
    pub(crate) fn new(completion: Completion, count: usize) -> Option<Arc<Self>> {
        if count == 0 {
            completion(Ok(()));
            return None;
        }
        Some(Arc::new(Self {
            remaining: AtomicUsize::new(count),
            inner: Mutex::new(Some(completion)),
        }))
    }

    pub(crate) fn part(self: &Arc<Self>) -> Completion {
        let this = self.clone();
        Box::new(move |result| match result {
            Ok(()) => {
                if this.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    this.finish(Ok(()));
                }
            }
            Err(e) => this.finish(Err(e)),
        })
    }

    fn finish(&self, result: Result<(), SessionError>) {
        let completion = self.inner.lock().take();
        if let Some(completion) = completion {
            completion(result);
        }
    }
}
