//! Promtunnel Agent - scrape targets on behalf of a remote proxy
//!
//! The agent lives next to the metrics endpoints it serves, usually behind
//! NAT or a firewall. It dials out to the proxy, registers one target path,
//! and then holds two streams open:
//!
//! 1. **Pull**: the proxy streams scrape requests down to the agent
//! 2. **Push**: the agent streams results back, in whatever order they finish
//!
//! Each request is fetched concurrently by a [`ScrapeFetcher`]; the default
//! [`HttpFetcher`] maps the request name to a configured URL. When either
//! stream ends the agent reconnects with exponential backoff.
//!
//! # Example Usage
//!
//! ```no_run
//! use promtunnel_agent::{Agent, AgentConfig, TargetConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig {
//!         proxy_addr: "proxy.example.com:50051".to_string(),
//!         targets: vec![TargetConfig::new("node", "http://localhost:9100/metrics")],
//!         ..AgentConfig::default()
//!     };
//!
//!     let agent = Agent::new(config)?;
//!     agent.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod cli;
pub mod config;
pub mod fetcher;

pub use agent::{Agent, AgentError, Registration, TunnelEnd};
pub use cli::AgentArgs;
pub use config::{normalize_proxy_addr, AgentConfig, ConfigFile, TargetConfig};
pub use fetcher::{HttpFetcher, ScrapeFetcher};
