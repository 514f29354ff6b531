//! Promtunnel Agent - serves local scrape targets to a remote proxy

use anyhow::{Context, Result};
use clap::Parser;
use promtunnel_agent::{Agent, AgentArgs};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Promtunnel agent - answers scrape requests pulled from a proxy
#[derive(Parser, Debug)]
#[command(name = "promtunnel-agent")]
#[command(version)]
#[command(long_about = r#"
Promtunnel Agent dials out to a promtunnel proxy, registers a target path and
answers the proxy's scrape requests by fetching local metrics endpoints.
No inbound port needs to be opened on the agent's side.

EXAMPLES:
  # Serve node_exporter as "node"
  promtunnel-agent --proxy proxy.example.com:50051 \
    --path node --url http://localhost:9100/metrics

  # Serve several targets from a config file
  promtunnel-agent --config agent.yaml

ENVIRONMENT VARIABLES:
  PROMTUNNEL_PROXY          Proxy tunnel address
  PROMTUNNEL_CONFIG         Configuration file
  PROMTUNNEL_PATH           Target path to register
  PROMTUNNEL_URL            Local URL for the target path
  PROMTUNNEL_FETCH_TIMEOUT  Per-scrape timeout in seconds
"#)]
struct Cli {
    #[command(flatten)]
    agent: AgentArgs,
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
    setup_logging(&cli.agent.log_level)?;

    info!("Promtunnel Agent starting...");

    let config = cli
        .agent
        .into_config()
        .context("Failed to build agent configuration")?;

    info!("Proxy: {}", config.proxy_addr);
    for target in &config.targets {
        info!("Target: /{} -> {}", target.path.trim_start_matches('/'), target.url);
    }

    let agent = Agent::new(config).context("Failed to create agent")?;
    let shutdown = CancellationToken::new();

    let mut agent_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
            match agent_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Agent error during shutdown: {}", e),
                Err(e) => error!("Agent task panicked: {}", e),
            }
        }
        result = &mut agent_task => {
            match result {
                Ok(Ok(())) => info!("Agent stopped normally"),
                Ok(Err(e)) => {
                    error!("Agent error: {:#}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Agent task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    info!("Agent stopped");
    Ok(())
}
