//! Synchronous entry point for scrape callers

use crate::correlation::{CorrelationTable, ScrapeError};
use crate::dispatcher::ScrapeDispatcher;
use promtunnel_proto::ScrapeResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Turns "give me target X" into a queued request plus a wait on its slot
#[derive(Debug, Clone)]
pub struct ScrapeBridge {
    table: Arc<CorrelationTable>,
    dispatcher: Arc<ScrapeDispatcher>,
}

impl ScrapeBridge {
    pub fn new(table: Arc<CorrelationTable>, dispatcher: Arc<ScrapeDispatcher>) -> Self {
        Self { table, dispatcher }
    }

    /// Submit a scrape and wait up to `deadline` for its result
    ///
    /// The deadline only bounds this caller's wait. A request already handed
    /// to an agent is not recalled; its late result is discarded by the table.
    pub async fn submit(&self, name: &str, deadline: Duration) -> Result<ScrapeResult, ScrapeError> {
        let pending = self.table.allocate(name)?;

        // Slot first, then queue: an agent can never answer an id whose slot
        // does not exist yet
        if self.dispatcher.enqueue(pending.request().clone()).is_err() {
            debug!(scrape_id = pending.id(), "Submit refused, dispatcher closed");
            return Err(ScrapeError::DispatcherClosed);
        }

        pending.wait(deadline).await
    }

    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    pub fn dispatcher(&self) -> &Arc<ScrapeDispatcher> {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn bridge() -> ScrapeBridge {
        ScrapeBridge::new(
            Arc::new(CorrelationTable::new()),
            Arc::new(ScrapeDispatcher::new()),
        )
    }

    #[tokio::test]
    async fn test_submit_round_trip() {
        let bridge = bridge();
        let agent = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let request = bridge.dispatcher().dequeue(&cancel).await.unwrap();
                assert_eq!(request.name, "node");
                bridge
                    .table()
                    .fulfil(ScrapeResult::success(request.id, "up 1\n"));
            })
        };

        let result = bridge.submit("node", Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.text(), "up 1\n");
        agent.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_expires_without_agents() {
        let bridge = bridge();
        let started = tokio::time::Instant::now();
        let err = bridge
            .submit("x", Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(matches!(err, ScrapeError::Expired { .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
        // The request itself stays queued for whichever agent comes next
        assert_eq!(bridge.dispatcher().len(), 1);
        assert_eq!(bridge.table().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_dispatcher_close() {
        let bridge = bridge();
        bridge.dispatcher().close();

        let err = bridge.submit("x", Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, ScrapeError::DispatcherClosed);
        // The slot opened for the refused request does not linger
        assert_eq!(bridge.table().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_table_close() {
        let bridge = bridge();
        bridge.table().close();

        let err = bridge.submit("x", Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, ScrapeError::DispatcherClosed);
        assert!(bridge.dispatcher().is_empty());
    }
}
