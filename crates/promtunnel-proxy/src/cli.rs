//! Command line options shared by `promtunnel-proxy` and `promtunnel proxy`

use clap::Args;
use std::net::SocketAddr;
use std::time::Duration;

use crate::server::ProxyConfig;

/// Proxy options
#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    /// Address agents connect to
    #[arg(long, env = "PROMTUNNEL_LISTEN", default_value = "0.0.0.0:50051")]
    pub listen: SocketAddr,

    /// Address of the HTTP front end scrapers call
    #[arg(long, env = "PROMTUNNEL_HTTP", default_value = "0.0.0.0:8080")]
    pub http: SocketAddr,

    /// Host name used in the proxy URLs handed to agents (default: this machine's hostname)
    #[arg(long, env = "PROMTUNNEL_PUBLIC_HOST")]
    pub public_host: Option<String>,

    /// Seconds a scrape waits for its agent before answering 503
    #[arg(
        long,
        env = "PROMTUNNEL_SCRAPE_TIMEOUT",
        default_value = "5",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub scrape_timeout_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ProxyArgs {
    /// Default log filter when RUST_LOG is not set
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    pub fn into_config(self) -> ProxyConfig {
        let defaults = ProxyConfig::default();
        ProxyConfig {
            tunnel_addr: self.listen,
            http_addr: self.http,
            public_host: self.public_host.unwrap_or(defaults.public_host),
            scrape_timeout: Duration::from_secs(self.scrape_timeout_secs),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        proxy: ProxyArgs,
    }

    fn parse(args: &[&str]) -> Result<ProxyArgs, clap::Error> {
        TestCli::try_parse_from(std::iter::once("proxy").chain(args.iter().copied()))
            .map(|cli| cli.proxy)
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.log_level(), "info");

        let config = args.into_config();
        assert_eq!(config.tunnel_addr, "0.0.0.0:50051".parse().unwrap());
        assert_eq!(config.http_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.scrape_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--listen",
            "127.0.0.1:6000",
            "--http",
            "127.0.0.1:6001",
            "--public-host",
            "metrics.example.com",
            "--scrape-timeout-secs",
            "12",
            "-v",
        ])
        .unwrap();
        assert_eq!(config.log_level(), "debug");

        let config = config.into_config();
        assert_eq!(config.tunnel_addr.port(), 6000);
        assert_eq!(config.http_addr.port(), 6001);
        assert_eq!(config.public_host, "metrics.example.com");
        assert_eq!(config.scrape_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(parse(&["--scrape-timeout-secs", "0"]).is_err());
    }
}
