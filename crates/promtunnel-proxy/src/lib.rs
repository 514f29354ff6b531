//! Promtunnel Proxy - scrape agents that cannot be reached directly
//!
//! The proxy runs two listeners:
//!
//! ```text
//!  scraper ──GET /node──► HTTP front end ──► ScrapeBridge ──► ScrapeDispatcher
//!                                                 ▲                   │ pull stream
//!                                                 │                   ▼
//!                                          CorrelationTable ◄── agent (push stream)
//! ```
//!
//! Agents dial the tunnel listener, register a target path and hold a pull
//! stream and a push stream open. Each HTTP request becomes one scrape
//! request handed to whichever agent pulls next; the answer is matched back
//! to the waiting HTTP request by correlation id.
//!
//! # Example Usage
//!
//! ```no_run
//! use promtunnel_proxy::{ProxyConfig, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ProxyServer::new(ProxyConfig::default());
//!     server
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod http;
pub mod server;

pub use cli::ProxyArgs;
pub use http::{router, HttpState, DEFAULT_CONTENT_TYPE};
pub use server::{ProxyConfig, ProxyError, ProxyHandle, ProxyServer};
