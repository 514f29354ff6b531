//! Tunnel RPC handler
//!
//! Every agent connection carries exactly one RPC; the first frame says which.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use promtunnel_proto::{AgentMetadata, ProxyMessage};
use promtunnel_transport::{MessageSender, TransportError, TransportStream};

use crate::agent_registry::{AgentRegistry, RegisteredAgent};
use crate::correlation::CorrelationTable;
use crate::dispatcher::ScrapeDispatcher;
use crate::session::{CloseReason, SessionError, SessionManager, TunnelSession};

/// How long a new connection may take to send its first frame
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors while serving one agent connection
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection closed before first message")]
    ClosedBeforeHandshake,

    #[error("No first message within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Unknown agent {0}")]
    UnknownAgent(u64),

    #[error("Session rejected: {0}")]
    Session(#[from] SessionError),

    #[error("Unexpected first message: {0}")]
    UnexpectedMessage(&'static str),
}

/// Serves the Register / PullRequests / PushResults RPCs
#[derive(Debug, Clone)]
pub struct TunnelHandler {
    registry: Arc<AgentRegistry>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<ScrapeDispatcher>,
    table: Arc<CorrelationTable>,
    handshake_timeout: Duration,
}

impl TunnelHandler {
    pub fn new(
        registry: Arc<AgentRegistry>,
        sessions: Arc<SessionManager>,
        dispatcher: Arc<ScrapeDispatcher>,
        table: Arc<CorrelationTable>,
    ) -> Self {
        Self {
            registry,
            sessions,
            dispatcher,
            table,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Register an agent and open its session
    pub fn register_agent(
        &self,
        hostname: &str,
        target_path: &str,
        metadata: AgentMetadata,
    ) -> RegisteredAgent {
        let agent = self.registry.register(hostname, target_path, metadata);
        self.sessions.insert(Arc::new(TunnelSession::new(
            agent.agent_id,
            agent.target_path.clone(),
            agent.registered_at,
        )));
        agent
    }

    /// Drop an agent whose session has ended
    pub fn retire_agent(&self, agent_id: u64) {
        if let Some(session) = self.sessions.remove(agent_id) {
            debug!(
                agent_id = agent_id,
                reason = ?session.close_reason(),
                "Retiring agent session"
            );
        }
        self.registry.unregister(agent_id);
    }

    /// Serve one agent connection until its RPC completes
    pub async fn handle_stream<S>(&self, stream: S, peer_addr: SocketAddr)
    where
        S: TransportStream + 'static,
    {
        debug!("New tunnel connection from {}", peer_addr);
        let mut stream = stream;

        let first_message = match self.read_first(&mut stream).await {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping connection from {}: {}", peer_addr, e);
                return;
            }
        };

        let result = match first_message {
            ProxyMessage::Register {
                hostname,
                target_path,
                metadata,
            } => {
                info!(
                    "Agent registration from {}: {} (target: {})",
                    peer_addr, hostname, target_path
                );
                self.handle_register(stream, &hostname, &target_path, metadata)
                    .await
            }
            ProxyMessage::PullRequests { agent_id } => self.handle_pull(stream, agent_id).await,
            ProxyMessage::PushResults { agent_id } => self.handle_push(stream, agent_id).await,
            other => {
                let kind = other.kind();
                reject(&mut stream, format!("Invalid first message: {}", kind)).await;
                Err(HandlerError::UnexpectedMessage(kind))
            }
        };

        if let Err(e) = result {
            error!("Tunnel RPC from {} failed: {}", peer_addr, e);
        }
    }

    async fn read_first<S>(&self, stream: &mut S) -> Result<ProxyMessage, HandlerError>
    where
        S: TransportStream,
    {
        match tokio::time::timeout(self.handshake_timeout, stream.recv_message()).await {
            Ok(Ok(Some(msg))) => Ok(msg),
            Ok(Ok(None)) => Err(HandlerError::ClosedBeforeHandshake),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HandlerError::HandshakeTimeout(self.handshake_timeout)),
        }
    }

    async fn handle_register<S>(
        &self,
        mut stream: S,
        hostname: &str,
        target_path: &str,
        metadata: AgentMetadata,
    ) -> Result<(), HandlerError>
    where
        S: TransportStream,
    {
        let agent = self.register_agent(hostname, target_path, metadata);
        let reply = ProxyMessage::Registered {
            agent_id: agent.agent_id,
            proxy_url: agent.proxy_url,
        };
        if let Err(e) = stream.send_message(&reply).await {
            // The agent never learned its id, so nothing will attach
            self.retire_agent(agent.agent_id);
            return Err(e.into());
        }
        stream.finish().await?;
        Ok(())
    }

    async fn handle_pull<S>(&self, mut stream: S, agent_id: u64) -> Result<(), HandlerError>
    where
        S: TransportStream,
    {
        let session = self.attach(&mut stream, agent_id, TunnelSession::attach_pull).await?;
        self.log_attached(agent_id, "pull");

        let (send, recv) = stream.split();
        session.run_outbound(&self.dispatcher, send, recv).await;
        self.retire_agent(agent_id);
        Ok(())
    }

    async fn handle_push<S>(&self, mut stream: S, agent_id: u64) -> Result<(), HandlerError>
    where
        S: TransportStream,
    {
        let session = self.attach(&mut stream, agent_id, TunnelSession::attach_push).await?;
        self.log_attached(agent_id, "push");

        let (send, recv) = stream.split();
        session.run_inbound(&self.table, send, recv).await;
        self.retire_agent(agent_id);
        Ok(())
    }

    fn log_attached(&self, agent_id: u64, direction: &'static str) {
        match self.registry.get(agent_id) {
            Some(agent) => info!(
                agent_id = agent_id,
                hostname = %agent.hostname,
                target_path = %agent.target_path,
                direction = direction,
                "Tunnel stream attached"
            ),
            None => info!(agent_id = agent_id, direction = direction, "Tunnel stream attached"),
        }
    }

    /// Look up the session, claim one direction of it and confirm to the agent
    async fn attach<S>(
        &self,
        stream: &mut S,
        agent_id: u64,
        claim: fn(&TunnelSession) -> Result<(), SessionError>,
    ) -> Result<Arc<TunnelSession>, HandlerError>
    where
        S: TransportStream,
    {
        let Some(session) = self.sessions.get(agent_id) else {
            reject(stream, format!("Unknown agent {}", agent_id)).await;
            return Err(HandlerError::UnknownAgent(agent_id));
        };

        if let Err(e) = claim(session.as_ref()) {
            reject(stream, e.to_string()).await;
            return Err(e.into());
        }

        if let Err(e) = stream
            .send_message(&ProxyMessage::Streaming { agent_id })
            .await
        {
            session.close(CloseReason::StreamError);
            self.retire_agent(agent_id);
            return Err(e.into());
        }
        Ok(session)
    }
}

async fn reject<S>(stream: &mut S, reason: String)
where
    S: MessageSender,
{
    debug!(reason = %reason, "Rejecting tunnel RPC");
    let _ = stream.send_message(&ProxyMessage::Rejected { reason }).await;
    let _ = stream.finish().await;
}
