//! Shared FIFO of pending scrape requests
//!
//! One queue for the whole proxy: callers append, and whichever agent
//! session asks next takes the head. There is no routing affinity, any
//! agent may serve any request.

use promtunnel_proto::ScrapeRequest;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Dispatcher errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// Shutdown has begun; the dispatcher accepts and hands out nothing more
    #[error("Dispatcher closed")]
    Closed,

    /// The waiting session was cancelled before an item arrived
    #[error("Dequeue cancelled")]
    Cancelled,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ScrapeRequest>,
    closed: bool,
}

/// FIFO work queue drained by agent sessions
#[derive(Debug, Default)]
pub struct ScrapeDispatcher {
    state: Mutex<QueueState>,
    available: Notify,
}

impl ScrapeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a request to the tail of the queue
    pub fn enqueue(&self, request: ScrapeRequest) -> Result<(), DispatchError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(DispatchError::Closed);
            }
            debug!(scrape_id = request.id, name = %request.name, "Enqueued scrape request");
            state.queue.push_back(request);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Take the head of the queue, waiting until one is available
    ///
    /// Returns `Cancelled` as soon as `cancel` fires and `Closed` once the
    /// dispatcher is closed, even for callers already waiting. An item is
    /// removed under the lock, so two concurrent callers never get the same one.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<ScrapeRequest, DispatchError> {
        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            // Register interest before looking at the queue so a concurrent
            // enqueue or close between the check and the await is not missed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(DispatchError::Closed);
                }
                if let Some(request) = state.queue.pop_front() {
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the baton so another idle session picks up the rest
                        self.available.notify_one();
                    }
                    return Ok(request);
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Close the dispatcher and release every waiting session
    ///
    /// Requests still queued are dropped; their callers fail by deadline or
    /// when the correlation table closes.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut state = self.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            let dropped = state.queue.len();
            state.queue.clear();
            dropped
        };
        self.available.notify_waiters();
        info!(dropped_requests = dropped, "Dispatcher closed");
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of requests waiting for an agent
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
