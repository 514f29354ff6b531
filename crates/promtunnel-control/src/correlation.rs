//! Correlation of scrape results to the callers waiting on them
//!
//! Every outstanding scrape owns one slot keyed by its correlation id. The
//! slot holds the sending end of a oneshot channel; the caller holds the
//! receiving end inside a [`PendingScrape`] guard. A slot leaves the table
//! exactly once: fulfilled by a result, expired by its caller's deadline,
//! dropped when the caller goes away, or drained on shutdown.

use promtunnel_proto::{ScrapeRequest, ScrapeResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Caller-visible scrape failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScrapeError {
    #[error("Scrape {id} expired after {waited:?} without a result")]
    Expired { id: u64, waited: Duration },

    #[error("Dispatcher closed")]
    DispatcherClosed,
}

/// What happened to a result handed to [`CorrelationTable::fulfil`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfilOutcome {
    /// The waiting caller got it
    Delivered,
    /// No live slot for this id (expired, already fulfilled, or never issued)
    UnknownId,
    /// The slot existed but its caller had already stopped waiting
    CallerGone,
}

#[derive(Debug)]
struct PendingSlot {
    request: ScrapeRequest,
    completion: oneshot::Sender<ScrapeResult>,
    created_at: Instant,
}

#[derive(Debug, Default)]
struct TableState {
    last_id: u64,
    slots: HashMap<u64, PendingSlot>,
    closed: bool,
}

/// Maps correlation ids to single-shot completion slots
#[derive(Debug, Default)]
pub struct CorrelationTable {
    state: Mutex<TableState>,
    anomalies: AtomicU64,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a fresh id and open its slot
    ///
    /// The counter and the insertion share one critical section, so ids are
    /// unique and strictly increasing no matter how many callers race here.
    pub fn allocate(&self, name: &str) -> Result<PendingScrape<'_>, ScrapeError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if state.closed {
            return Err(ScrapeError::DispatcherClosed);
        }

        state.last_id += 1;
        let request = ScrapeRequest::new(state.last_id, name);
        state.slots.insert(
            request.id,
            PendingSlot {
                request: request.clone(),
                completion: tx,
                created_at: Instant::now(),
            },
        );
        drop(state);

        debug!(scrape_id = request.id, name = %name, "Allocated correlation slot");
        Ok(PendingScrape {
            table: self,
            request,
            receiver: rx,
            settled: false,
        })
    }

    /// Deliver a result to the caller waiting on its id
    ///
    /// Never fails: stale, duplicate and unknown ids are counted as anomalies
    /// and the result is discarded, so one bad datum cannot end a tunnel.
    pub fn fulfil(&self, result: ScrapeResult) -> FulfilOutcome {
        let id = result.id;
        let mut state = self.lock();
        let Some(slot) = state.slots.remove(&id) else {
            drop(state);
            self.record_anomaly();
            warn!(scrape_id = id, "Discarding result for unknown correlation id");
            return FulfilOutcome::UnknownId;
        };

        // Sent under the lock: once a slot is gone from the map its result,
        // if any, is already sitting in the receiver
        let elapsed = slot.created_at.elapsed();
        let sent = slot.completion.send(result);
        drop(state);

        match sent {
            Ok(()) => {
                debug!(
                    scrape_id = id,
                    name = %slot.request.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Delivered scrape result"
                );
                FulfilOutcome::Delivered
            }
            Err(_) => {
                self.record_anomaly();
                warn!(scrape_id = id, "Discarding result, caller stopped waiting");
                FulfilOutcome::CallerGone
            }
        }
    }

    /// Fail every pending slot with `DispatcherClosed` and refuse new ones
    pub fn close(&self) -> usize {
        let drained: Vec<PendingSlot> = {
            let mut state = self.lock();
            state.closed = true;
            state.slots.drain().map(|(_, slot)| slot).collect()
        };
        // Dropping the senders wakes every receiver with RecvError
        let count = drained.len();
        drop(drained);
        info!(released = count, "Correlation table closed");
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of callers still waiting for a result
    pub fn pending_count(&self) -> usize {
        self.lock().slots.len()
    }

    /// Results discarded so far (unknown, duplicate or late ids)
    pub fn anomaly_count(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }

    fn record_anomaly(&self) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
    }

    fn remove(&self, id: u64) -> Option<PendingSlot> {
        self.lock().slots.remove(&id)
    }
}

/// A caller's claim on one correlation slot
///
/// Dropping it without waiting (e.g. the HTTP client hung up) removes the slot,
/// turning any later result for the id into an anomaly.
#[derive(Debug)]
pub struct PendingScrape<'a> {
    table: &'a CorrelationTable,
    request: ScrapeRequest,
    receiver: oneshot::Receiver<ScrapeResult>,
    settled: bool,
}

impl PendingScrape<'_> {
    pub fn id(&self) -> u64 {
        self.request.id
    }

    /// The request to hand to the dispatcher
    pub fn request(&self) -> &ScrapeRequest {
        &self.request
    }

    /// Wait for the result until `deadline` elapses
    ///
    /// On expiry the slot is removed before returning, so a result arriving
    /// afterwards cannot reach this or any other caller.
    pub async fn wait(mut self, deadline: Duration) -> Result<ScrapeResult, ScrapeError> {
        let id = self.request.id;
        let started = Instant::now();
        let outcome = tokio::time::timeout(deadline, &mut self.receiver).await;
        self.settled = true;

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ScrapeError::DispatcherClosed),
            Err(_) => {
                if self.table.remove(id).is_some() {
                    let waited = started.elapsed();
                    debug!(scrape_id = id, waited_ms = waited.as_millis() as u64, "Scrape expired");
                    return Err(ScrapeError::Expired { id, waited });
                }
                // Lost the race to a fulfil or close; whichever won has
                // already resolved the channel
                match self.receiver.try_recv() {
                    Ok(result) => Ok(result),
                    Err(_) => Err(ScrapeError::DispatcherClosed),
                }
            }
        }
    }
}

impl Drop for PendingScrape<'_> {
    fn drop(&mut self) {
        if !self.settled && self.table.remove(self.request.id).is_some() {
            debug!(scrape_id = self.request.id, "Caller abandoned scrape");
        }
    }
}
