//! Wiring of the tunnel core and its lifecycle

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use promtunnel_proto::DEFAULT_HTTP_PORT;
use promtunnel_transport::TransportListener;

use crate::agent_registry::AgentRegistry;
use crate::bridge::ScrapeBridge;
use crate::correlation::CorrelationTable;
use crate::dispatcher::ScrapeDispatcher;
use crate::handler::{TunnelHandler, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::session::{CloseReason, SessionManager};
use crate::task_tracker::TaskTracker;

/// Settings of the tunnel core
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Host name scrapers use to reach the proxy, embedded in proxy URLs
    pub public_host: String,
    /// Port of the HTTP front end, embedded in proxy URLs
    pub http_port: u16,
    /// Registered sessions with no stream attached after this long are dropped
    pub unattached_session_timeout: Duration,
    /// Time a new connection gets to send its first frame
    pub handshake_timeout: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            public_host: promtunnel_proto::local_hostname(),
            http_port: DEFAULT_HTTP_PORT,
            unattached_session_timeout: Duration::from_secs(60),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Owns the registry, queue, correlation table and sessions
#[derive(Debug)]
pub struct ControlPlane {
    config: ControlPlaneConfig,
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<ScrapeDispatcher>,
    table: Arc<CorrelationTable>,
    sessions: Arc<SessionManager>,
    bridge: ScrapeBridge,
    handler: TunnelHandler,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl ControlPlane {
    pub fn new(config: ControlPlaneConfig) -> Self {
        let registry = Arc::new(AgentRegistry::new(&config.public_host, config.http_port));
        let dispatcher = Arc::new(ScrapeDispatcher::new());
        let table = Arc::new(CorrelationTable::new());
        let sessions = Arc::new(SessionManager::new());

        let bridge = ScrapeBridge::new(table.clone(), dispatcher.clone());
        let handler = TunnelHandler::new(
            registry.clone(),
            sessions.clone(),
            dispatcher.clone(),
            table.clone(),
        )
        .with_handshake_timeout(config.handshake_timeout);

        Self {
            config,
            registry,
            dispatcher,
            table,
            sessions,
            bridge,
            handler,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// Entry point for scrape callers
    pub fn bridge(&self) -> ScrapeBridge {
        self.bridge.clone()
    }

    pub fn handler(&self) -> &TunnelHandler {
        &self.handler
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<ScrapeDispatcher> {
        &self.dispatcher
    }

    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Fires when shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Accept agent connections on `listener` until shutdown
    pub fn spawn_listener<L>(&self, listener: L)
    where
        L: TransportListener + 'static,
    {
        let handler = self.handler.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer_addr)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle_stream(stream, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept tunnel connection: {}", e);
                        // Avoid spinning on persistent accept errors (e.g. fd exhaustion)
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            debug!("Tunnel listener stopped");
        });
        self.tasks.register("tunnel-listener", handle);
    }

    /// Periodically drop registrations that never attached a stream
    pub fn spawn_reaper(&self) {
        let timeout = self.config.unattached_session_timeout;
        let period = (timeout / 2).max(Duration::from_millis(100));
        let sessions = self.sessions.clone();
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for agent_id in sessions.reap_unattached(timeout) {
                    warn!(agent_id = agent_id, "Dropping agent that never opened its tunnel");
                    registry.unregister(agent_id);
                }
            }
        });
        self.tasks.register("session-reaper", handle);
    }

    /// Stop the core
    ///
    /// Blocked dequeues are released first, then every session is closed,
    /// then every caller still waiting gets `DispatcherClosed`.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(
            agents = self.registry.count(),
            pending = self.table.pending_count(),
            "Shutting down tunnel core"
        );
        self.shutdown.cancel();
        for agent in self.registry.list() {
            debug!(
                agent_id = agent.agent_id,
                hostname = %agent.hostname,
                target_path = %agent.target_path,
                "Disconnecting agent"
            );
        }

        self.dispatcher.close();
        let closed = self.sessions.close_all(CloseReason::ProxyShutdown);
        let released = self.table.close();
        let aborted = self.tasks.abort_all();

        info!(
            sessions_closed = closed,
            callers_released = released,
            tasks_aborted = aborted,
            anomalies = self.table.anomaly_count(),
            "Tunnel core stopped"
        );
    }
}
