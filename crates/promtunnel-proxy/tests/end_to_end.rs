//! Proxy, agent and scrape target wired together over real sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use promtunnel_agent::{Agent, AgentConfig, ScrapeFetcher, TargetConfig};
use promtunnel_control::SessionState;
use promtunnel_proto::{ScrapeRequest, ScrapeResult};
use promtunnel_proxy::{ProxyConfig, ProxyHandle, ProxyServer, DEFAULT_CONTENT_TYPE};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

async fn start_proxy(scrape_timeout: Duration) -> ProxyHandle {
    ProxyServer::new(ProxyConfig {
        tunnel_addr: "127.0.0.1:0".parse().unwrap(),
        http_addr: "127.0.0.1:0".parse().unwrap(),
        public_host: "127.0.0.1".to_string(),
        scrape_timeout,
        ..ProxyConfig::default()
    })
    .start()
    .await
    .unwrap()
}

async fn start_target() -> SocketAddr {
    let app = Router::new().route(
        "/metrics",
        get(|| async { ([("content-type", "text/plain; version=0.0.4; charset=utf-8")], "up 1\n") }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn agent_config(proxy: &ProxyHandle, path: &str, url: String) -> AgentConfig {
    AgentConfig {
        proxy_addr: proxy.tunnel_addr().to_string(),
        targets: vec![TargetConfig::new(path, url)],
        fetch_timeout: Duration::from_secs(2),
        initial_reconnect_delay: Duration::from_millis(50),
        max_reconnect_delay: Duration::from_millis(200),
        ..AgentConfig::default()
    }
}

fn spawn_agent(agent: Agent, shutdown: &CancellationToken) -> JoinHandle<()> {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        agent.run(shutdown).await.unwrap();
    })
}

/// Wait until `count` agents have an attached tunnel
async fn wait_for_streaming(proxy: &ProxyHandle, count: usize) {
    timeout(WAIT, async {
        loop {
            let streaming = proxy
                .control()
                .registry()
                .list()
                .iter()
                .filter(|agent| {
                    proxy
                        .control()
                        .sessions()
                        .get(agent.agent_id)
                        .map(|s| s.state() == SessionState::Streaming)
                        .unwrap_or(false)
                })
                .count();
            if streaming >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agents should connect");
}

fn url(proxy: &ProxyHandle, name: &str) -> String {
    format!("http://{}/{}", proxy.http_addr(), name)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scrape_through_tunnel() {
    let proxy = start_proxy(Duration::from_secs(5)).await;
    let target = start_target().await;
    let shutdown = CancellationToken::new();

    let agent = Agent::new(agent_config(
        &proxy,
        "node",
        format!("http://{}/metrics", target),
    ))
    .unwrap();
    let agent_task = spawn_agent(agent, &shutdown);
    wait_for_streaming(&proxy, 1).await;

    let response = reqwest::get(url(&proxy, "node")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; version=0.0.4; charset=utf-8"
    );
    assert_eq!(response.headers()["cache-control"], "no-cache");
    assert_eq!(response.text().await.unwrap(), "up 1\n");

    // Names the agent has no target for fail on the agent side
    let response = reqwest::get(url(&proxy, "unknown")).await.unwrap();
    assert_eq!(response.status().as_u16(), 404);
    assert!(response.text().await.unwrap().is_empty());

    // Reserved and missing paths never reach the agent
    for path in ["metrics", ""] {
        let response = reqwest::get(url(&proxy, path)).await.unwrap();
        assert_eq!(response.status().as_u16(), 404);
    }

    shutdown.cancel();
    timeout(WAIT, agent_task).await.unwrap().unwrap();
    proxy.shutdown();
    timeout(WAIT, proxy.wait()).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nested_target_path_is_served_at_its_proxy_url() {
    let proxy = start_proxy(Duration::from_secs(5)).await;
    let target = start_target().await;
    let shutdown = CancellationToken::new();

    let agent = Agent::new(agent_config(
        &proxy,
        "team-a/app",
        format!("http://{}/metrics", target),
    ))
    .unwrap();
    let agent_task = spawn_agent(agent, &shutdown);
    wait_for_streaming(&proxy, 1).await;

    // The URL handed out at registration must answer as-is
    let registered = proxy.control().registry().list();
    let proxy_url = registered[0].proxy_url.clone();
    assert_eq!(
        proxy_url,
        format!("http://127.0.0.1:{}/team-a/app", proxy.http_addr().port())
    );

    let response = reqwest::get(proxy_url).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "up 1\n");

    shutdown.cancel();
    timeout(WAIT, agent_task).await.unwrap().unwrap();
    proxy.shutdown();
    timeout(WAIT, proxy.wait()).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_agent_answers_503_after_timeout() {
    let proxy = start_proxy(Duration::from_millis(200)).await;

    let started = tokio::time::Instant::now();
    let response = reqwest::get(url(&proxy, "node")).await.unwrap();
    assert_eq!(response.status().as_u16(), 503);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(proxy.control().table().pending_count(), 0);

    proxy.shutdown();
    timeout(WAIT, proxy.wait()).await.unwrap().unwrap();
}

/// Echoes the requested name and reports which agent answered
#[derive(Debug)]
struct NamedFetcher {
    agent: &'static str,
}

#[async_trait]
impl ScrapeFetcher for NamedFetcher {
    async fn fetch(&self, request: &ScrapeRequest) -> ScrapeResult {
        // Uneven latency so answers come back out of order
        tokio::time::sleep(Duration::from_millis(request.id % 5)).await;
        ScrapeResult::success(request.id, format!("{} {}", request.name, self.agent))
            .with_content_type(DEFAULT_CONTENT_TYPE)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_scrapes_get_their_own_answer() {
    let proxy = start_proxy(Duration::from_secs(5)).await;
    let shutdown = CancellationToken::new();

    let mut agents = Vec::new();
    for name in ["a", "b"] {
        let agent = Agent::with_fetcher(
            agent_config(&proxy, name, "http://unused".to_string()),
            Arc::new(NamedFetcher { agent: name }),
        );
        agents.push(spawn_agent(agent, &shutdown));
    }
    wait_for_streaming(&proxy, 2).await;

    let client = reqwest::Client::new();
    let mut scrapes = Vec::new();
    for i in 0..50 {
        let client = client.clone();
        let url = url(&proxy, &format!("job-{}", i));
        scrapes.push(tokio::spawn(async move {
            let response = client.get(url).send().await.unwrap();
            assert_eq!(response.status().as_u16(), 200);
            (i, response.text().await.unwrap())
        }));
    }

    for scrape in scrapes {
        let (i, body) = timeout(WAIT, scrape).await.unwrap().unwrap();
        let (name, agent) = body.split_once(' ').unwrap();
        assert_eq!(name, format!("job-{}", i));
        assert!(agent == "a" || agent == "b");
    }
    assert_eq!(proxy.control().table().pending_count(), 0);
    assert_eq!(proxy.control().table().anomaly_count(), 0);

    shutdown.cancel();
    for agent in agents {
        timeout(WAIT, agent).await.unwrap().unwrap();
    }
    proxy.shutdown();
    timeout(WAIT, proxy.wait()).await.unwrap().unwrap();
}

/// Never answers, so scrapes stay pending until the proxy stops
#[derive(Debug)]
struct StuckFetcher;

#[async_trait]
impl ScrapeFetcher for StuckFetcher {
    async fn fetch(&self, _request: &ScrapeRequest) -> ScrapeResult {
        std::future::pending().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_releases_waiting_scrapes() {
    let proxy = start_proxy(Duration::from_secs(30)).await;
    let shutdown = CancellationToken::new();
    let agent = Agent::with_fetcher(
        agent_config(&proxy, "stuck", "http://unused".to_string()),
        Arc::new(StuckFetcher),
    );
    let agent_task = spawn_agent(agent, &shutdown);
    wait_for_streaming(&proxy, 1).await;

    let scrape = tokio::spawn(reqwest::get(url(&proxy, "stuck")));
    timeout(WAIT, async {
        while proxy.control().table().pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    proxy.shutdown();
    let response = timeout(WAIT, scrape).await.unwrap().unwrap().unwrap();
    assert_eq!(response.status().as_u16(), 503);
    timeout(WAIT, proxy.wait()).await.unwrap().unwrap();

    // The agent keeps retrying until told to stop
    shutdown.cancel();
    timeout(WAIT, agent_task).await.unwrap().unwrap();
}
