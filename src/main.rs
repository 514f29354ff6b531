//! Promtunnel CLI - Prometheus scrapes through outbound-only tunnels
//!
//! One binary for both ends: `promtunnel proxy` on the reachable side,
//! `promtunnel agent` next to the metrics endpoints.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use promtunnel_agent::{Agent, AgentArgs};
use promtunnel_proxy::{ProxyArgs, ProxyServer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Promtunnel - scrape Prometheus targets behind NAT
#[derive(Parser, Debug)]
#[command(name = "promtunnel")]
#[command(about = "Promtunnel - scrape Prometheus targets behind NAT")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy that scrapers talk to
    #[command(long_about = r#"
Run the proxy. Agents connect to the tunnel listener; scrapers request
http://<public-host>:<http-port>/<name> and get the answer of whichever agent
picked the request up.

EXAMPLES:
  # Default ports (tunnel 50051, HTTP 8080)
  promtunnel proxy

  # Publish under a fixed host name
  promtunnel proxy --public-host metrics.example.com --scrape-timeout-secs 10

ENVIRONMENT VARIABLES:
  PROMTUNNEL_LISTEN          Tunnel listener address
  PROMTUNNEL_HTTP            HTTP front end address
  PROMTUNNEL_PUBLIC_HOST     Host name used in proxy URLs
  PROMTUNNEL_SCRAPE_TIMEOUT  Seconds a scrape waits for its agent
    "#)]
    Proxy {
        #[command(flatten)]
        args: ProxyArgs,
    },

    /// Run an agent that serves local targets to a proxy
    #[command(long_about = r#"
Run an agent. It dials out to the proxy, registers a target path and answers
scrape requests by fetching local metrics endpoints. Reconnects with
exponential backoff whenever the tunnel drops.

EXAMPLES:
  # Serve node_exporter as "node"
  promtunnel agent --proxy proxy.example.com \
    --path node --url http://localhost:9100/metrics

  # Several targets from a YAML file
  promtunnel agent --config agent.yaml

ENVIRONMENT VARIABLES:
  PROMTUNNEL_PROXY          Proxy tunnel address
  PROMTUNNEL_CONFIG         Configuration file
  PROMTUNNEL_PATH           Target path to register
  PROMTUNNEL_URL            Local URL for the target path
  PROMTUNNEL_FETCH_TIMEOUT  Per-scrape timeout in seconds
    "#)]
    Agent {
        #[command(flatten)]
        args: AgentArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Proxy { args } => {
            init_logging(args.log_level())?;
            run_proxy(args).await
        }
        Commands::Agent { args } => {
            init_logging(&args.log_level)?;
            run_agent(args).await
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

async fn run_proxy(args: ProxyArgs) -> Result<()> {
    info!(
        "Starting promtunnel proxy {} ({})",
        env!("GIT_TAG"),
        env!("GIT_HASH")
    );

    ProxyServer::new(args.into_config())
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down...");
        })
        .await
        .context("Proxy failed")
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    info!(
        "Starting promtunnel agent {} ({})",
        env!("GIT_TAG"),
        env!("GIT_HASH")
    );

    let config = args
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
            result
                .context("Agent task panicked")?
                .context("Agent failed")?;
        }
    }

    info!("Agent stopped");
    Ok(())
}
