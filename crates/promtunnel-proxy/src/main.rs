//! Promtunnel Proxy - serves scrapes for agents behind NAT

use anyhow::{Context, Result};
use clap::Parser;
use promtunnel_proxy::{ProxyArgs, ProxyServer};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Promtunnel proxy - forwards HTTP scrapes to registered agents
#[derive(Parser, Debug)]
#[command(name = "promtunnel-proxy")]
#[command(version)]
#[command(long_about = r#"
Promtunnel Proxy accepts outbound connections from promtunnel agents and
serves their metrics over HTTP. A scrape of http://<proxy>:8080/<name> is
handed to a connected agent, which fetches <name> locally and sends the
answer back.

EXAMPLES:
  # Listen with the default ports
  promtunnel-proxy

  # Custom ports and the host name scrapers use
  promtunnel-proxy --listen 0.0.0.0:6000 --http 0.0.0.0:9000 \
    --public-host metrics.example.com

ENVIRONMENT VARIABLES:
  PROMTUNNEL_LISTEN          Tunnel listener address
  PROMTUNNEL_HTTP            HTTP front end address
  PROMTUNNEL_PUBLIC_HOST     Host name used in proxy URLs
  PROMTUNNEL_SCRAPE_TIMEOUT  Seconds a scrape waits for its agent
"#)]
struct Cli {
    #[command(flatten)]
    proxy: ProxyArgs,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.proxy.log_level())?;

    info!("Promtunnel Proxy starting...");

    let config = cli.proxy.into_config();
    info!("Scrape timeout: {}s", config.scrape_timeout.as_secs());

    ProxyServer::new(config)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down...");
        })
        .await
        .context("Proxy failed")?;

    Ok(())
}
