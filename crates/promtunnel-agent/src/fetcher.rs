//! Fetching metrics text from local targets

use async_trait::async_trait;
use promtunnel_proto::{ScrapeRequest, ScrapeResult};
use reqwest::header::CONTENT_TYPE;
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, info};

use crate::agent::AgentError;
use crate::config::TargetConfig;

/// Status reported when the agent has no target for the requested name
pub const STATUS_UNKNOWN_TARGET: u16 = 404;
/// Status reported when the target could not be reached at all
pub const STATUS_FETCH_FAILED: u16 = 503;

/// Produces the result for one scrape request
///
/// Never fails: every problem becomes a `Failure` result carrying a status
/// code, so the proxy can answer its caller.
#[async_trait]
pub trait ScrapeFetcher: Send + Sync + Debug {
    async fn fetch(&self, request: &ScrapeRequest) -> ScrapeResult;
}

/// Fetches targets over HTTP
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    /// path (without leading '/') -> URL
    targets: HashMap<String, String>,
}

impl HttpFetcher {
    pub fn new(targets: &[TargetConfig], timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::InvalidConfig(format!("Failed to build HTTP client: {}", e)))?;

        let targets = targets
            .iter()
            .map(|t| (target_key(&t.path).to_string(), t.url.clone()))
            .collect();

        Ok(Self { client, targets })
    }

    /// URL configured for `name`, if any
    pub fn url_for(&self, name: &str) -> Option<&str> {
        self.targets.get(target_key(name)).map(String::as_str)
    }
}

fn target_key(path: &str) -> &str {
    path.trim_start_matches('/')
}

#[async_trait]
impl ScrapeFetcher for HttpFetcher {
    async fn fetch(&self, request: &ScrapeRequest) -> ScrapeResult {
        let Some(url) = self.url_for(&request.name) else {
            info!(scrape_id = request.id, name = %request.name, "No target configured for path");
            return ScrapeResult::failure(
                request.id,
                STATUS_UNKNOWN_TARGET,
                format!("Unknown target: {}", request.name),
            );
        };

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                info!(scrape_id = request.id, url = %url, error = %e, "Failed HTTP request");
                return ScrapeResult::failure(request.id, STATUS_FETCH_FAILED, e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            debug!(scrape_id = request.id, url = %url, status = %status, "Target answered with error");
            return ScrapeResult::failure(
                request.id,
                status.as_u16(),
                format!("Target returned {}", status),
            );
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match response.bytes().await {
            Ok(body) => {
                debug!(scrape_id = request.id, bytes = body.len(), "Scraped target");
                let result =
                    ScrapeResult::success(request.id, body.to_vec()).with_status_code(status.as_u16());
                match content_type {
                    Some(content_type) => result.with_content_type(content_type),
                    None => result,
                }
            }
            Err(e) => {
                info!(scrape_id = request.id, url = %url, error = %e, "Failed reading target body");
                ScrapeResult::failure(request.id, STATUS_FETCH_FAILED, e.to_string())
            }
        }
    }
}
