//! Agent registry for tracking registered agents
//!
//! Hands out agent ids and computes the externally visible URL for the
//! target path an agent declares. Paths are not validated and duplicates are
//! fine: routing is done by the shared dispatcher queue, never by path.

use chrono::{DateTime, Utc};
use promtunnel_proto::AgentMetadata;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A registered agent with its registration metadata
#[derive(Debug, Clone)]
pub struct RegisteredAgent {
    /// Unique, strictly increasing identifier for this agent
    pub agent_id: u64,
    /// Hostname the agent reported
    pub hostname: String,
    /// Target path the agent declared (e.g., "node_exporter")
    pub target_path: String,
    /// URL scrapers use to reach this target through the proxy
    pub proxy_url: String,
    /// Agent metadata (platform, version, etc.)
    pub metadata: AgentMetadata,
    /// Timestamp when this agent registered
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryState {
    last_agent_id: u64,
    agents: HashMap<u64, RegisteredAgent>,
}

/// Registry for managing registered agents
#[derive(Debug)]
pub struct AgentRegistry {
    /// "http://host:port" prefix of every proxy URL
    public_base_url: String,
    state: Mutex<RegistryState>,
}

impl AgentRegistry {
    /// Create a new empty agent registry
    ///
    /// `public_host`/`http_port` are where scrapers reach the proxy's HTTP front end.
    pub fn new(public_host: &str, http_port: u16) -> Self {
        tracing::info!(
            public_host = %public_host,
            http_port = http_port,
            "Creating new agent registry"
        );
        Self {
            public_base_url: format!("http://{}:{}", public_host, http_port),
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// URL under which `target_path` is served by the proxy
    pub fn proxy_url(&self, target_path: &str) -> String {
        format!("{}/{}", self.public_base_url, target_path)
    }

    /// Register an agent; always succeeds
    pub fn register(
        &self,
        hostname: &str,
        target_path: &str,
        metadata: AgentMetadata,
    ) -> RegisteredAgent {
        let mut state = self.lock();
        state.last_agent_id += 1;

        let agent = RegisteredAgent {
            agent_id: state.last_agent_id,
            hostname: hostname.to_string(),
            target_path: target_path.to_string(),
            proxy_url: self.proxy_url(target_path),
            metadata,
            registered_at: Utc::now(),
        };
        state.agents.insert(agent.agent_id, agent.clone());
        drop(state);

        tracing::info!(
            agent_id = agent.agent_id,
            hostname = %agent.hostname,
            target_path = %agent.target_path,
            proxy_url = %agent.proxy_url,
            "Registered new agent"
        );

        agent
    }

    /// Unregister an agent by ID
    ///
    /// Returns the agent if it was registered, or None if not found.
    pub fn unregister(&self, agent_id: u64) -> Option<RegisteredAgent> {
        let agent = self.lock().agents.remove(&agent_id);

        if agent.is_some() {
            tracing::info!(agent_id = agent_id, "Unregistered agent");
        } else {
            tracing::debug!(agent_id = agent_id, "Agent already unregistered");
        }

        agent
    }

    /// Get information about a specific agent
    pub fn get(&self, agent_id: u64) -> Option<RegisteredAgent> {
        self.lock().agents.get(&agent_id).cloned()
    }

    /// List all registered agents, oldest first
    pub fn list(&self) -> Vec<RegisteredAgent> {
        let mut agents: Vec<_> = self.lock().agents.values().cloned().collect();
        agents.sort_by_key(|a| a.agent_id);
        agents
    }

    /// Get the total count of registered agents
    pub fn count(&self) -> usize {
        self.lock().agents.len()
    }
}
