//! HTTP front end: `GET /{path}` becomes one scrape through the tunnel

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use promtunnel_control::{ScrapeBridge, ScrapeError};
use promtunnel_proto::{ScrapeOutcome, ScrapeResult};

/// Content type used when the agent did not report one
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Shared state of the HTTP handlers
#[derive(Debug, Clone)]
pub struct HttpState {
    pub bridge: ScrapeBridge,
    pub scrape_timeout: Duration,
}

/// Build the scrape router
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(missing_name))
        // Reserved for the proxy's own metrics
        .route("/metrics", get(reserved))
        // Target paths may span several segments, e.g. `team-a/app`
        .route("/{*name}", get(scrape))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn missing_name() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn reserved() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn scrape(State(state): State<HttpState>, Path(name): Path<String>) -> Response {
    match state.bridge.submit(&name, state.scrape_timeout).await {
        Ok(result) => {
            debug!(
                scrape_id = result.id,
                name = %name,
                status = result.status_code,
                bytes = result.payload.len(),
                "Scrape answered"
            );
            result_response(result)
        }
        Err(ScrapeError::Expired { id, waited }) => {
            warn!(
                scrape_id = id,
                name = %name,
                waited_ms = waited.as_millis() as u64,
                "Scrape expired"
            );
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
        Err(ScrapeError::DispatcherClosed) => {
            debug!(name = %name, "Scrape refused, proxy shutting down");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// Turn an agent's result into the HTTP answer
fn result_response(result: ScrapeResult) -> Response {
    match result.outcome {
        ScrapeOutcome::Success => {
            let status = StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::OK);
            let content_type = result
                .content_type
                .as_deref()
                .and_then(|value| HeaderValue::from_str(value).ok())
                .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

            (
                status,
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
                ],
                Body::from(result.payload),
            )
                .into_response()
        }
        ScrapeOutcome::Failure => {
            if let Some(detail) = &result.detail {
                debug!(scrape_id = result.id, detail = %detail, "Agent reported scrape failure");
            }
            failure_status(result.status_code).into_response()
        }
    }
}

/// Failures always answer with an error status
fn failure_status(code: u16) -> StatusCode {
    match StatusCode::from_u16(code) {
        Ok(status) if status.is_client_error() || status.is_server_error() => status,
        _ => StatusCode::BAD_GATEWAY,
    }
}
