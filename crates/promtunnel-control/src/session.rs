//! Per-agent tunnel sessions
//!
//! A session is created when an agent registers and lives until its tunnel
//! ends. The tunnel is two streams, each on its own connection: the pull
//! stream carries dequeued requests out, the push stream carries results in.
//! The two directions run independently; either one ending closes the
//! session, which cancels the other.
//!
//! ```text
//! Open ──attach pull/push──> Streaming ──EOF / error / shutdown──> Closed
//!   └───────────────────── never attached (reaped) ─────────────────┘
//! ```

use crate::correlation::CorrelationTable;
use crate::dispatcher::{DispatchError, ScrapeDispatcher};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use promtunnel_proto::ProxyMessage;
use promtunnel_transport::{MessageReceiver, MessageSender, TransportError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on the Disconnect and close writes of a finished pull stream
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, no stream attached yet
    Open,
    /// At least one stream attached and running
    Streaming,
    /// Terminal
    Closed,
}

/// Why a session reached `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// One of the agent's streams ended
    AgentDisconnected,
    /// The proxy is shutting down
    ProxyShutdown,
    /// A stream failed with a transport or protocol error
    StreamError,
    /// The agent registered but never attached a stream in time
    Unattached,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::AgentDisconnected => "agent disconnected",
            CloseReason::ProxyShutdown => "proxy shutting down",
            CloseReason::StreamError => "stream error",
            CloseReason::Unattached => "no stream attached",
        };
        f.write_str(s)
    }
}

/// Errors attaching a stream to a session
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session {0} is closed")]
    Closed(u64),

    #[error("Session {agent_id} already has a {direction} stream")]
    AlreadyAttached {
        agent_id: u64,
        direction: &'static str,
    },
}

/// One registered agent's tunnel
#[derive(Debug)]
pub struct TunnelSession {
    agent_id: u64,
    target_path: String,
    registered_at: DateTime<Utc>,
    opened_at: Instant,
    last_activity: Mutex<DateTime<Utc>>,
    state: Mutex<SessionState>,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
    pull_attached: AtomicBool,
    push_attached: AtomicBool,
    delivered: AtomicU64,
    received: AtomicU64,
}

impl TunnelSession {
    pub fn new(agent_id: u64, target_path: impl Into<String>, registered_at: DateTime<Utc>) -> Self {
        Self {
            agent_id,
            target_path: target_path.into(),
            registered_at,
            opened_at: Instant::now(),
            last_activity: Mutex::new(registered_at),
            state: Mutex::new(SessionState::Open),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
            pull_attached: AtomicBool::new(false),
            push_attached: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    pub fn agent_id(&self) -> u64 {
        self.agent_id
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *lock(&self.last_activity)
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *lock(&self.close_reason)
    }

    /// Requests forwarded to the agent so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Results received from the agent so far
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Fires once the session is closed
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn touch(&self) {
        *lock(&self.last_activity) = Utc::now();
    }

    /// Attach the pull (proxy -> agent) stream
    pub fn attach_pull(&self) -> Result<(), SessionError> {
        self.attach(&self.pull_attached, "pull")
    }

    /// Attach the push (agent -> proxy) stream
    pub fn attach_push(&self) -> Result<(), SessionError> {
        self.attach(&self.push_attached, "push")
    }

    fn attach(&self, flag: &AtomicBool, direction: &'static str) -> Result<(), SessionError> {
        let mut state = lock(&self.state);
        if *state == SessionState::Closed {
            return Err(SessionError::Closed(self.agent_id));
        }
        if flag.swap(true, Ordering::AcqRel) {
            return Err(SessionError::AlreadyAttached {
                agent_id: self.agent_id,
                direction,
            });
        }
        if *state == SessionState::Open {
            *state = SessionState::Streaming;
            debug!(agent_id = self.agent_id, "Session streaming");
        }
        drop(state);
        self.touch();
        Ok(())
    }

    /// Move to `Closed` and cancel both stream loops
    ///
    /// Returns true only for the call that actually closed the session.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
            *lock(&self.close_reason) = Some(reason);
        }
        self.cancel.cancel();

        info!(
            agent_id = self.agent_id,
            target_path = %self.target_path,
            reason = %reason,
            delivered = self.delivered(),
            received = self.received(),
            "Tunnel session closed"
        );
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Serve the pull stream: dequeue requests and forward them to the agent
    ///
    /// The receive half is watched concurrently so an agent that hangs up is
    /// noticed while this loop is parked in `dequeue`, not at the next write.
    pub async fn run_outbound<S, R>(&self, dispatcher: &ScrapeDispatcher, mut send: S, mut recv: R)
    where
        S: MessageSender,
        R: MessageReceiver,
    {
        let forward = async {
            loop {
                let request = match dispatcher.dequeue(&self.cancel).await {
                    Ok(request) => request,
                    Err(DispatchError::Cancelled) => break,
                    Err(DispatchError::Closed) => {
                        self.close(CloseReason::ProxyShutdown);
                        break;
                    }
                };

                let scrape_id = request.id;
                let message = ProxyMessage::Scrape(request);
                // An agent that stops reading must not keep this loop alive
                let sent = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        debug!(
                            agent_id = self.agent_id,
                            scrape_id = scrape_id,
                            "Session closed mid-forward, caller will expire"
                        );
                        break;
                    }
                    sent = send.send_message(&message) => sent,
                };
                if let Err(e) = sent {
                    // Already out of the queue; its caller fails by deadline
                    warn!(
                        agent_id = self.agent_id,
                        scrape_id = scrape_id,
                        error = %e,
                        "Failed to forward scrape request, caller will expire"
                    );
                    self.close(CloseReason::StreamError);
                    break;
                }

                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.touch();
                debug!(agent_id = self.agent_id, scrape_id = scrape_id, "Forwarded scrape request");
            }

            let goodbye = async {
                if self.close_reason() == Some(CloseReason::ProxyShutdown) {
                    let disconnect = ProxyMessage::Disconnect {
                        reason: CloseReason::ProxyShutdown.to_string(),
                    };
                    if let Err(e) = send.send_message(&disconnect).await {
                        debug!(agent_id = self.agent_id, error = %e, "Could not send Disconnect");
                    }
                }
                let _ = send.finish().await;
            };
            if tokio::time::timeout(GOODBYE_TIMEOUT, goodbye).await.is_err() {
                debug!(agent_id = self.agent_id, "Agent not reading, dropping pull stream");
            }
        };

        let watch = async {
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    msg = recv.recv_message() => match msg {
                        Ok(None) => {
                            self.close(CloseReason::AgentDisconnected);
                            break;
                        }
                        Ok(Some(ProxyMessage::Disconnect { reason })) => {
                            debug!(agent_id = self.agent_id, reason = %reason, "Agent closed pull stream");
                            self.close(CloseReason::AgentDisconnected);
                            break;
                        }
                        Ok(Some(other)) => {
                            warn!(
                                agent_id = self.agent_id,
                                kind = other.kind(),
                                "Ignoring unexpected message on pull stream"
                            );
                        }
                        Err(e) => {
                            self.close(stream_close_reason(&e));
                            break;
                        }
                    },
                }
            }
        };

        tokio::join!(forward, watch);
    }

    /// Serve the push stream: hand each incoming result to the table
    ///
    /// A result for an unknown id is absorbed by the table and never ends
    /// the stream. On a clean end of stream the agent gets an `Ack`.
    pub async fn run_inbound<S, R>(&self, table: &CorrelationTable, mut send: S, mut recv: R)
    where
        S: MessageSender,
        R: MessageReceiver,
    {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                msg = recv.recv_message() => msg,
            };

            match msg {
                Ok(Some(ProxyMessage::Result(result))) => {
                    self.received.fetch_add(1, Ordering::Relaxed);
                    self.touch();
                    table.fulfil(result);
                }
                Ok(Some(ProxyMessage::Disconnect { reason })) => {
                    debug!(agent_id = self.agent_id, reason = %reason, "Agent closed push stream");
                    self.close(CloseReason::AgentDisconnected);
                    break;
                }
                Ok(Some(other)) => {
                    warn!(
                        agent_id = self.agent_id,
                        kind = other.kind(),
                        "Ignoring unexpected message on push stream"
                    );
                }
                Ok(None) => {
                    let ack = ProxyMessage::Ack {
                        received: self.received(),
                    };
                    if let Err(e) = send.send_message(&ack).await {
                        debug!(agent_id = self.agent_id, error = %e, "Could not send Ack");
                    }
                    self.close(CloseReason::AgentDisconnected);
                    break;
                }
                Err(e) => {
                    warn!(agent_id = self.agent_id, error = %e, "Push stream failed");
                    self.close(stream_close_reason(&e));
                    break;
                }
            }
        }

        let _ = send.finish().await;
    }
}

fn stream_close_reason(error: &TransportError) -> CloseReason {
    match error {
        TransportError::StreamClosed => CloseReason::AgentDisconnected,
        TransportError::IoError(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
            ) =>
        {
            CloseReason::AgentDisconnected
        }
        _ => CloseReason::StreamError,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live sessions keyed by agent id
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<u64, Arc<TunnelSession>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<TunnelSession>) {
        if let Some(old) = self.sessions.insert(session.agent_id(), session) {
            old.close(CloseReason::StreamError);
        }
    }

    pub fn get(&self, agent_id: u64) -> Option<Arc<TunnelSession>> {
        self.sessions.get(&agent_id).map(|s| s.value().clone())
    }

    pub fn remove(&self, agent_id: u64) -> Option<Arc<TunnelSession>> {
        self.sessions.remove(&agent_id).map(|(_, s)| s)
    }

    /// Close every session; returns how many were still open
    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().close(reason))
            .count()
    }

    /// Close and drop sessions that never attached a stream within `older_than`
    ///
    /// Returns the agent ids removed so their registrations can be retired too.
    pub fn reap_unattached(&self, older_than: Duration) -> Vec<u64> {
        let stale: Vec<u64> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.state() == SessionState::Open && session.opened_at.elapsed() >= older_than
            })
            .map(|entry| *entry.key())
            .collect();

        for agent_id in &stale {
            if let Some((_, session)) = self.sessions.remove(agent_id) {
                session.close(CloseReason::Unattached);
            }
        }
        stale
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
