//! Command line options shared by `promtunnel-agent` and `promtunnel agent`

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::config::{AgentConfig, ConfigFile, TargetConfig};

/// Agent options
#[derive(Args, Debug, Clone)]
pub struct AgentArgs {
    /// Proxy tunnel address (host[:port], default port 50051)
    #[arg(long, env = "PROMTUNNEL_PROXY")]
    pub proxy: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "PROMTUNNEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Target path to register (used together with --url)
    #[arg(long, env = "PROMTUNNEL_PATH", requires = "url")]
    pub path: Option<String>,

    /// Local URL to scrape for --path
    #[arg(long, env = "PROMTUNNEL_URL", requires = "path")]
    pub url: Option<String>,

    /// Timeout for one scrape of a local target, in seconds
    #[arg(long, env = "PROMTUNNEL_FETCH_TIMEOUT", default_value = "10")]
    pub fetch_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Maximum reconnection delay in seconds
    #[arg(long, default_value = "60")]
    pub max_reconnect_delay: u64,
}

impl AgentArgs {
    /// Merge the config file (if any) with CLI args, CLI taking precedence
    pub fn into_config(self) -> Result<AgentConfig> {
        let file = match &self.config {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                ConfigFile::load(path)?
            }
            None => ConfigFile::default(),
        };

        let proxy_addr = self
            .proxy
            .or(file.proxy)
            .context("Proxy address is required (use --proxy or config file)")?;

        let mut targets = file.targets;
        if let (Some(path), Some(url)) = (self.path, self.url) {
            // The CLI target becomes the registered one
            targets.retain(|t| t.path != path);
            targets.insert(0, TargetConfig::new(path, url));
        }

        let config = AgentConfig {
            proxy_addr,
            targets,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            max_reconnect_delay: Duration::from_secs(self.max_reconnect_delay),
            ..AgentConfig::default()
        };
        config.validate().context("Invalid agent configuration")?;
        Ok(config)
    }
}
