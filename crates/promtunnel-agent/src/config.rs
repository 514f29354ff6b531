//! Agent configuration
//!
//! An agent is configured programmatically through [`AgentConfig`], or from a
//! YAML file plus command line overrides:
//!
//! ```yaml
//! proxy: proxy.example.com:50051
//! targets:
//!   - path: node
//!     url: http://localhost:9100/metrics
//!   - path: app
//!     url: http://localhost:8080/metrics
//! ```

use promtunnel_proto::DEFAULT_TUNNEL_PORT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::agent::AgentError;

/// One scrapeable endpoint behind the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Name scrapers use on the proxy (`GET /{path}`)
    pub path: String,
    /// Local URL the agent fetches for it
    pub url: String,
}

impl TargetConfig {
    pub fn new(path: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            url: url.into(),
        }
    }
}

/// Runtime settings of an agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Proxy tunnel address (host:port)
    pub proxy_addr: String,
    /// Hostname reported at registration
    pub hostname: String,
    /// Targets served by this agent; the first one is the registered path
    pub targets: Vec<TargetConfig>,
    /// Per-scrape timeout against a local target
    pub fetch_timeout: Duration,
    /// TCP connect timeout towards the proxy
    pub connect_timeout: Duration,
    /// First delay after a lost connection
    pub initial_reconnect_delay: Duration,
    /// Upper bound of the reconnect delay
    pub max_reconnect_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            proxy_addr: format!("localhost:{}", DEFAULT_TUNNEL_PORT),
            hostname: promtunnel_proto::local_hostname(),
            targets: Vec::new(),
            fetch_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

impl AgentConfig {
    /// Path announced to the proxy at registration
    pub fn registered_path(&self) -> Option<&str> {
        self.targets.first().map(|t| t.path.as_str())
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.proxy_addr.is_empty() {
            return Err(AgentError::InvalidConfig(
                "Proxy address cannot be empty".to_string(),
            ));
        }
        if self.targets.is_empty() {
            return Err(AgentError::InvalidConfig(
                "At least one target (path + url) is required".to_string(),
            ));
        }
        for target in &self.targets {
            if target.path.trim_matches('/').is_empty() {
                return Err(AgentError::InvalidConfig(format!(
                    "Target path for '{}' cannot be empty",
                    target.url
                )));
            }
            if !(target.url.starts_with("http://") || target.url.starts_with("https://")) {
                return Err(AgentError::InvalidConfig(format!(
                    "Target URL '{}' must start with http:// or https://",
                    target.url
                )));
            }
        }
        Ok(())
    }
}

/// On-disk configuration format
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Proxy tunnel address
    #[serde(default)]
    pub proxy: Option<String>,

    /// Targets to serve
    #[serde(default, alias = "agent_configs")]
    pub targets: Vec<TargetConfig>,
}

impl ConfigFile {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            AgentError::InvalidConfig(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&contents).map_err(|e| {
            AgentError::InvalidConfig(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }
}

/// Append the default tunnel port when `addr` has none
pub fn normalize_proxy_addr(addr: &str) -> String {
    let addr = addr.trim();
    let has_port = match addr.rsplit_once(':') {
        // "[::1]:50051" or "host:50051"
        Some((host, port)) => {
            !host.is_empty() && port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_TUNNEL_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config_file() {
        let yaml = r#"
proxy: proxy.example.com:6000
targets:
  - path: node
    url: http://localhost:9100/metrics
  - path: app
    url: http://localhost:8080/metrics
"#;
        let config = ConfigFile::parse(yaml).unwrap();
        assert_eq!(config.proxy.as_deref(), Some("proxy.example.com:6000"));
        assert_eq!(config.targets.len(), 2);
        assert_eq!(
            config.targets[1],
            TargetConfig::new("app", "http://localhost:8080/metrics")
        );
    }

    #[test]
    fn test_legacy_key_accepted() {
        let yaml = r#"
agent_configs:
  - path: node
    url: http://localhost:9100/metrics
"#;
        let config = ConfigFile::parse(yaml).unwrap();
        assert!(config.proxy.is_none());
        assert_eq!(config.targets[0].path, "node");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "proxy: localhost:50051").unwrap();
        writeln!(file, "targets:").unwrap();
        writeln!(file, "  - path: node").unwrap();
        writeln!(file, "    url: http://127.0.0.1:9100/metrics").unwrap();

        let config = ConfigFile::load(file.path()).unwrap();
        assert_eq!(config.targets.len(), 1);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConfigFile::load(Path::new("/nonexistent/agent.yaml")).unwrap_err();
        assert!(matches!(err, AgentError::InvalidConfig(_)));
    }

    #[test]
    fn test_normalize_proxy_addr() {
        assert_eq!(normalize_proxy_addr("proxy.local"), "proxy.local:50051");
        assert_eq!(normalize_proxy_addr("proxy.local:7000"), "proxy.local:7000");
        assert_eq!(normalize_proxy_addr("127.0.0.1:9"), "127.0.0.1:9");
        assert_eq!(normalize_proxy_addr("[::1]:7000"), "[::1]:7000");
    }

    #[test]
    fn test_validate() {
        let mut config = AgentConfig::default();
        assert!(config.validate().is_err());

        config.targets.push(TargetConfig::new("node", "http://localhost:9100/metrics"));
        assert!(config.validate().is_ok());
        assert_eq!(config.registered_path(), Some("node"));

        config.targets.push(TargetConfig::new("bad", "localhost:9100"));
        assert!(config.validate().is_err());
    }
}
