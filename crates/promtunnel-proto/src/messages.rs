//! Protocol message types

use serde::{Deserialize, Serialize};

/// Main proxy protocol message enum
///
/// Every RPC runs on its own connection and the first frame the agent sends
/// selects which one: `Register`, `PullRequests` or `PushResults`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ProxyMessage {
    // Unary registration
    /// Agent announces itself and the target path it serves
    Register {
        hostname: String,
        target_path: String,
        metadata: AgentMetadata,
    },
    /// Proxy assigns an agent id and the externally visible URL
    Registered { agent_id: u64, proxy_url: String },

    // Server-streamed requests
    /// Agent opens the outbound half of its tunnel
    PullRequests { agent_id: u64 },
    /// One dequeued scrape request, proxy -> agent
    Scrape(ScrapeRequest),

    // Client-streamed results
    /// Agent opens the inbound half of its tunnel
    PushResults { agent_id: u64 },
    /// One scrape result, agent -> proxy
    Result(ScrapeResult),
    /// Proxy acknowledges the end of a result stream
    Ack { received: u64 },

    // Stream control
    /// Proxy accepted a Pull/Push stream for this agent
    Streaming { agent_id: u64 },
    /// Proxy refused the stream (unknown agent, unexpected first frame)
    Rejected { reason: String },
    /// Either side is going away
    Disconnect { reason: String },
}

impl ProxyMessage {
    /// Short name used in logs and protocol errors
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyMessage::Register { .. } => "Register",
            ProxyMessage::Registered { .. } => "Registered",
            ProxyMessage::PullRequests { .. } => "PullRequests",
            ProxyMessage::Scrape(_) => "Scrape",
            ProxyMessage::PushResults { .. } => "PushResults",
            ProxyMessage::Result(_) => "Result",
            ProxyMessage::Ack { .. } => "Ack",
            ProxyMessage::Streaming { .. } => "Streaming",
            ProxyMessage::Rejected { .. } => "Rejected",
            ProxyMessage::Disconnect { .. } => "Disconnect",
        }
    }
}

/// A pending scrape, as offered to whichever agent pulls next
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScrapeRequest {
    /// Correlation id, unique for the proxy process lifetime
    pub id: u64,
    /// Target name the caller asked for
    pub name: String,
}

impl ScrapeRequest {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Whether the agent managed to produce the metrics text
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScrapeOutcome {
    Success,
    Failure,
}

/// The agent's answer to a [`ScrapeRequest`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScrapeResult {
    /// Must equal the originating request's id
    pub id: u64,
    pub outcome: ScrapeOutcome,
    /// HTTP status the agent observed (404 for an unknown target, 503 when the fetch failed)
    pub status_code: u16,
    pub content_type: Option<String>,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Human readable failure detail
    pub detail: Option<String>,
}

impl ScrapeResult {
    /// Successful scrape carrying the metrics text
    pub fn success(id: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            outcome: ScrapeOutcome::Success,
            status_code: 200,
            content_type: None,
            payload: payload.into(),
            detail: None,
        }
    }

    /// Failed scrape; the payload is always empty
    pub fn failure(id: u64, status_code: u16, detail: impl Into<String>) -> Self {
        Self {
            id,
            outcome: ScrapeOutcome::Failure,
            status_code,
            content_type: None,
            payload: Vec::new(),
            detail: Some(detail.into()),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ScrapeOutcome::Success
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

// Bytes are written as a length-prefixed blob instead of a sequence of u8
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

/// Agent metadata for identification and monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMetadata {
    pub hostname: String,
    pub platform: String, // e.g., "linux", "macos", "windows"
    pub version: String,  // Agent software version
}

impl Default for AgentMetadata {
    fn default() -> Self {
        Self {
            hostname: local_hostname(),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Hostname of this machine, or "unknown"
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = ProxyMessage::Register {
            hostname: "edge-1".to_string(),
            target_path: "node".to_string(),
            metadata: AgentMetadata::default(),
        };
        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: ProxyMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_scrape_result_with_binary_payload() {
        let payload = vec![0u8, 159, 146, 150, 255];
        let msg = ProxyMessage::Result(ScrapeResult::success(7, payload.clone()));

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: ProxyMessage = bincode::deserialize(&serialized).unwrap();

        if let ProxyMessage::Result(result) = deserialized {
            assert_eq!(result.id, 7);
            assert_eq!(result.payload, payload);
            assert!(result.is_success());
        } else {
            panic!("Expected Result message");
        }
    }

    #[test]
    fn test_failure_has_empty_payload_and_detail() {
        let result = ScrapeResult::failure(3, 404, "no target for name 'foo'");
        assert_eq!(result.outcome, ScrapeOutcome::Failure);
        assert_eq!(result.status_code, 404);
        assert!(result.payload.is_empty());
        assert_eq!(result.detail.as_deref(), Some("no target for name 'foo'"));
    }

    #[test]
    fn test_success_builder() {
        let result = ScrapeResult::success(1, "up 1\n")
            .with_content_type("text/plain; version=0.0.4")
            .with_status_code(203);
        assert_eq!(result.text(), "up 1\n");
        assert_eq!(result.status_code, 203);
        assert_eq!(
            result.content_type.as_deref(),
            Some("text/plain; version=0.0.4")
        );
    }

    #[test]
    fn test_message_kind() {
        assert_eq!(ProxyMessage::PullRequests { agent_id: 1 }.kind(), "PullRequests");
        assert_eq!(
            ProxyMessage::Scrape(ScrapeRequest::new(1, "foo")).kind(),
            "Scrape"
        );
        assert_eq!(ProxyMessage::Ack { received: 0 }.kind(), "Ack");
    }

    #[test]
    fn test_agent_metadata_default() {
        let metadata = AgentMetadata::default();
        assert!(!metadata.hostname.is_empty());
        assert_eq!(metadata.platform, std::env::consts::OS);
    }
}
