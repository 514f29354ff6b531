use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use promtunnel_proto::{AgentMetadata, ProxyMessage, ScrapeResult};
use promtunnel_transport::{
    MessageReceiver, MessageSender, TcpConnector, TcpRecvHalf, TcpSendHalf, TcpTransportStream,
    TransportError, TransportStream,
};

use crate::config::{normalize_proxy_addr, AgentConfig};
use crate::fetcher::{HttpFetcher, ScrapeFetcher};

/// Results waiting to be pushed; fetches block once this many are queued
const RESULT_QUEUE_SIZE: usize = 256;

/// How long to wait for the proxy's Ack after closing the push stream
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Proxy rejected stream: {0}")]
    Rejected(String),

    #[error("Unexpected message from proxy: {0}")]
    UnexpectedMessage(&'static str),

    #[error("Proxy closed the connection")]
    ConnectionClosed,
}

/// Identity the proxy assigned at registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub agent_id: u64,
    pub proxy_url: String,
}

/// How one tunnel ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEnd {
    /// Local shutdown was requested
    Shutdown,
    /// The proxy said goodbye or a stream ended
    Disconnected(String),
}

/// Scrape agent: registers with the proxy, pulls requests, pushes results
#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
    proxy_addr: String,
    connector: TcpConnector,
    fetcher: Arc<dyn ScrapeFetcher>,
}

impl Agent {
    /// Create an agent that scrapes its targets over HTTP
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let fetcher = HttpFetcher::new(&config.targets, config.fetch_timeout)?;
        Ok(Self::with_fetcher(config, Arc::new(fetcher)))
    }

    /// Create an agent with a custom fetcher
    pub fn with_fetcher(config: AgentConfig, fetcher: Arc<dyn ScrapeFetcher>) -> Self {
        Self {
            proxy_addr: normalize_proxy_addr(&config.proxy_addr),
            connector: TcpConnector::new(config.connect_timeout),
            config,
            fetcher,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run until `shutdown` fires, reconnecting with exponential backoff
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let initial_delay = self.config.initial_reconnect_delay;
        let max_delay = self.config.max_reconnect_delay;
        let mut current_delay = initial_delay;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            info!(
                "Connecting to proxy at {} (attempt {})",
                self.proxy_addr, attempt
            );

            match self.run_once(&shutdown).await {
                Ok(TunnelEnd::Shutdown) => {
                    info!("Agent stopped");
                    return Ok(());
                }
                Ok(TunnelEnd::Disconnected(reason)) => {
                    // A tunnel was up, so start over from the short delay
                    current_delay = initial_delay;
                    attempt = 0;
                    warn!("Tunnel to proxy ended: {}", reason);
                }
                Err(e) => {
                    error!("Agent error: {}", e);
                }
            }

            warn!(
                "Reconnecting in {}s (attempt {})...",
                current_delay.as_secs_f32(),
                attempt + 1
            );
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Agent stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(current_delay) => {}
            }
            current_delay = std::cmp::min(current_delay * 2, max_delay);
        }
    }

    /// Register and serve one tunnel until it ends
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<TunnelEnd, AgentError> {
        let registration = tokio::select! {
            _ = shutdown.cancelled() => return Ok(TunnelEnd::Shutdown),
            registration = self.register() => registration?,
        };
        info!(
            agent_id = registration.agent_id,
            proxy_url = %registration.proxy_url,
            "Registered with proxy"
        );

        let (pull_send, pull_recv) = self
            .open_stream(ProxyMessage::PullRequests {
                agent_id: registration.agent_id,
            })
            .await?;
        let (push_send, push_recv) = self
            .open_stream(ProxyMessage::PushResults {
                agent_id: registration.agent_id,
            })
            .await?;
        info!(agent_id = registration.agent_id, "Tunnel established");

        let tunnel = shutdown.child_token();
        let (results_tx, results_rx) = mpsc::channel(RESULT_QUEUE_SIZE);

        let (pulled, pushed) = tokio::join!(
            self.pull_loop(&tunnel, pull_send, pull_recv, results_tx),
            push_loop(&tunnel, push_send, push_recv, results_rx),
        );

        if shutdown.is_cancelled() {
            return Ok(TunnelEnd::Shutdown);
        }
        let reason = pulled.or(pushed).unwrap_or_else(|| "tunnel closed".to_string());
        Ok(TunnelEnd::Disconnected(reason))
    }

    /// Unary Register RPC
    pub async fn register(&self) -> Result<Registration, AgentError> {
        let target_path = self
            .config
            .registered_path()
            .ok_or_else(|| AgentError::InvalidConfig("No target configured".to_string()))?;

        let mut stream = self.connect().await?;
        let metadata = AgentMetadata {
            hostname: self.config.hostname.clone(),
            ..AgentMetadata::default()
        };
        stream
            .send_message(&ProxyMessage::Register {
                hostname: self.config.hostname.clone(),
                target_path: target_path.to_string(),
                metadata,
            })
            .await?;

        match stream.recv_message().await? {
            Some(ProxyMessage::Registered {
                agent_id,
                proxy_url,
            }) => Ok(Registration {
                agent_id,
                proxy_url,
            }),
            Some(ProxyMessage::Rejected { reason }) => Err(AgentError::RegistrationFailed(reason)),
            Some(other) => Err(AgentError::UnexpectedMessage(other.kind())),
            None => Err(AgentError::ConnectionClosed),
        }
    }

    async fn connect(&self) -> Result<TcpTransportStream, AgentError> {
        Ok(self.connector.connect(self.proxy_addr.as_str()).await?)
    }

    /// Open a Pull or Push stream and wait for the proxy to accept it
    async fn open_stream(
        &self,
        first: ProxyMessage,
    ) -> Result<(TcpSendHalf, TcpRecvHalf), AgentError> {
        let mut stream = self.connect().await?;
        stream.send_message(&first).await?;
        match stream.recv_message().await? {
            Some(ProxyMessage::Streaming { .. }) => Ok(stream.split()),
            Some(ProxyMessage::Rejected { reason }) => Err(AgentError::Rejected(reason)),
            Some(other) => Err(AgentError::UnexpectedMessage(other.kind())),
            None => Err(AgentError::ConnectionClosed),
        }
    }

    /// Receive requests and start a fetch for each
    ///
    /// Returns why the pull stream ended, or None on local cancellation.
    async fn pull_loop(
        &self,
        tunnel: &CancellationToken,
        mut send: TcpSendHalf,
        mut recv: TcpRecvHalf,
        results: mpsc::Sender<ScrapeResult>,
    ) -> Option<String> {
        let mut fetches = JoinSet::new();

        let reason = loop {
            let msg = tokio::select! {
                _ = tunnel.cancelled() => break None,
                Some(_) = fetches.join_next(), if !fetches.is_empty() => continue,
                msg = recv.recv_message() => msg,
            };

            match msg {
                Ok(Some(ProxyMessage::Scrape(request))) => {
                    debug!(scrape_id = request.id, name = %request.name, "Received scrape request");
                    let fetcher = self.fetcher.clone();
                    let results = results.clone();
                    fetches.spawn(async move {
                        let result = fetcher.fetch(&request).await;
                        // Push side gone means the tunnel is ending anyway
                        let _ = results.send(result).await;
                    });
                }
                Ok(Some(ProxyMessage::Disconnect { reason })) => {
                    info!("Proxy disconnected: {}", reason);
                    break Some(reason);
                }
                Ok(Some(other)) => {
                    warn!(kind = other.kind(), "Ignoring unexpected message on pull stream");
                }
                Ok(None) => break Some("pull stream closed by proxy".to_string()),
                Err(e) => break Some(format!("pull stream failed: {}", e)),
            }
        };
        tunnel.cancel();

        if reason.is_none() {
            // Tell the proxy we are leaving so it retires this session now
            let _ = send
                .send_message(&ProxyMessage::Disconnect {
                    reason: "agent shutting down".to_string(),
                })
                .await;
        }
        let _ = send.finish().await;
        fetches.abort_all();
        reason
    }
}

/// Forward finished results to the proxy
async fn push_loop(
    tunnel: &CancellationToken,
    mut send: TcpSendHalf,
    mut recv: TcpRecvHalf,
    mut results: mpsc::Receiver<ScrapeResult>,
) -> Option<String> {
    let reason = loop {
        let result = tokio::select! {
            _ = tunnel.cancelled() => break None,
            result = results.recv() => result,
        };
        let Some(result) = result else {
            break None;
        };

        let scrape_id = result.id;
        if let Err(e) = send.send_message(&ProxyMessage::Result(result)).await {
            break Some(format!("push stream failed: {}", e));
        }
        debug!(scrape_id = scrape_id, "Pushed scrape result");
    };
    tunnel.cancel();

    if send.finish().await.is_ok() {
        match tokio::time::timeout(ACK_TIMEOUT, recv.recv_message()).await {
            Ok(Ok(Some(ProxyMessage::Ack { received }))) => {
                debug!(received = received, "Proxy acknowledged results");
            }
            Ok(Ok(Some(other))) => debug!(kind = other.kind(), "Push stream ended without Ack"),
            _ => debug!("Push stream ended without Ack"),
        }
    }
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;

    fn config() -> AgentConfig {
        AgentConfig {
            proxy_addr: "127.0.0.1:1".to_string(),
            targets: vec![TargetConfig::new("node", "http://127.0.0.1:9100/metrics")],
            connect_timeout: Duration::from_millis(500),
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(40),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = Agent::new(AgentConfig::default()).unwrap_err();
        assert!(matches!(err, AgentError::InvalidConfig(_)));
    }

    #[test]
    fn test_proxy_addr_gets_default_port() {
        let agent = Agent::new(AgentConfig {
            proxy_addr: "proxy.local".to_string(),
            ..config()
        })
        .unwrap();
        assert_eq!(agent.proxy_addr, "proxy.local:50051");
    }

    #[tokio::test]
    async fn test_register_fails_when_proxy_unreachable() {
        let agent = Agent::new(config()).unwrap();
        assert!(matches!(
            agent.register().await,
            Err(AgentError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_while_retrying() {
        let agent = Agent::new(config()).unwrap();
        let shutdown = CancellationToken::new();

        let run = {
            let shutdown = shutdown.clone();
            async move { agent.run(shutdown).await }
        };
        let stop = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.cancel();
        };

        let (result, _) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(run, stop)
        })
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}
