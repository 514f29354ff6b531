//! Proxy server: tunnel listener, HTTP front end and their shared lifecycle

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use promtunnel_control::{ControlPlane, ControlPlaneConfig};
use promtunnel_proto::{DEFAULT_HTTP_PORT, DEFAULT_TUNNEL_PORT};
use promtunnel_transport::TcpTransportListener;

use crate::http::{router, HttpState};

/// Proxy server errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind {role} listener to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        role: &'static str,
        address: String,
        port: u16,
        reason: String,
    },

    #[error("HTTP server task failed: {0}")]
    ServerTask(String),
}

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Where agents connect
    pub tunnel_addr: SocketAddr,
    /// Where scrapers send `GET /{name}`
    pub http_addr: SocketAddr,
    /// Host name put into the proxy URL handed to agents
    pub public_host: String,
    /// How long one HTTP scrape waits for its agent
    pub scrape_timeout: Duration,
    /// Registrations that never open a stream are dropped after this long
    pub unattached_session_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tunnel_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_TUNNEL_PORT)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)),
            public_host: promtunnel_proto::local_hostname(),
            scrape_timeout: Duration::from_secs(5),
            unattached_session_timeout: Duration::from_secs(60),
        }
    }
}

/// The proxy: accepts agents and serves scrapes for them
pub struct ProxyServer {
    config: ProxyConfig,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    /// Bind both listeners and start serving in the background
    pub async fn start(self) -> Result<ProxyHandle, ProxyError> {
        let tunnel_listener = bind(self.config.tunnel_addr, "tunnel").await?;
        let http_listener = bind(self.config.http_addr, "HTTP").await?;
        let tunnel_addr = tunnel_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        let control = Arc::new(ControlPlane::new(ControlPlaneConfig {
            public_host: self.config.public_host.clone(),
            http_port: http_addr.port(),
            unattached_session_timeout: self.config.unattached_session_timeout,
            ..ControlPlaneConfig::default()
        }));
        control.spawn_listener(TcpTransportListener::from_listener(tunnel_listener));
        control.spawn_reaper();

        let app = router(HttpState {
            bridge: control.bridge(),
            scrape_timeout: self.config.scrape_timeout,
        });

        let shutdown = CancellationToken::new();
        let server = {
            let control = control.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                axum::serve(http_listener, app)
                    .with_graceful_shutdown(async move {
                        shutdown.cancelled().await;
                        // Release waiting scrapes before HTTP drains its connections
                        control.shutdown();
                    })
                    .await?;
                Ok::<(), ProxyError>(())
            })
        };

        info!("Tunnel listener on {}", tunnel_addr);
        info!("HTTP front end on {}", http_addr);
        info!(
            "Agents are published as http://{}:{}/<path>",
            self.config.public_host,
            http_addr.port()
        );

        Ok(ProxyHandle {
            tunnel_addr,
            http_addr,
            control,
            shutdown,
            server,
        })
    }

    /// Serve until `signal` resolves, then shut down gracefully
    pub async fn run<F>(self, signal: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let mut handle = self.start().await?;

        tokio::select! {
            _ = signal => {
                info!("Shutdown requested");
            }
            result = &mut handle.server => {
                error!("HTTP server stopped unexpectedly");
                handle.control.shutdown();
                return flatten(result);
            }
        }

        handle.shutdown();
        handle.wait().await
    }
}

async fn bind(addr: SocketAddr, role: &'static str) -> Result<TcpListener, ProxyError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::BindError {
            role,
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: e.to_string(),
        })
}

fn flatten(
    result: Result<Result<(), ProxyError>, tokio::task::JoinError>,
) -> Result<(), ProxyError> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(ProxyError::ServerTask(e.to_string())),
    }
}

/// A running proxy
pub struct ProxyHandle {
    tunnel_addr: SocketAddr,
    http_addr: SocketAddr,
    control: Arc<ControlPlane>,
    shutdown: CancellationToken,
    server: JoinHandle<Result<(), ProxyError>>,
}

impl ProxyHandle {
    pub fn tunnel_addr(&self) -> SocketAddr {
        self.tunnel_addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }

    /// Begin shutdown; idempotent
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the HTTP server to drain after `shutdown`
    pub async fn wait(self) -> Result<(), ProxyError> {
        let result = flatten(self.server.await);
        // Also covers a server that exited without the signal firing
        self.control.shutdown();
        info!("Proxy stopped");
        result
    }
}
