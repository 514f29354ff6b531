//! Tunnel core for the scrape proxy
//!
//! Callers submit a target name through [`ScrapeBridge`]; the request joins
//! the shared [`ScrapeDispatcher`] queue and a slot is opened for it in the
//! [`CorrelationTable`]. Whichever agent pulls next receives the request over
//! its [`TunnelSession`]; its result comes back on the session's push stream
//! and the table wakes exactly the caller that asked.
//!
//! ```text
//! caller ─submit─> ScrapeBridge ─allocate─> CorrelationTable <─fulfil─┐
//!                       └─enqueue─> ScrapeDispatcher ─dequeue─> TunnelSession ⇄ agent
//! ```
pub mod agent_registry;
pub mod bridge;
pub mod control_plane;
pub mod correlation;
pub mod dispatcher;
pub mod handler;
pub mod session;
pub mod task_tracker;

pub use agent_registry::{AgentRegistry, RegisteredAgent};
pub use bridge::ScrapeBridge;
pub use control_plane::{ControlPlane, ControlPlaneConfig};
pub use correlation::{CorrelationTable, FulfilOutcome, PendingScrape, ScrapeError};
pub use dispatcher::{DispatchError, ScrapeDispatcher};
pub use handler::{HandlerError, TunnelHandler, DEFAULT_HANDSHAKE_TIMEOUT};
pub use session::{CloseReason, SessionError, SessionManager, SessionState, TunnelSession};
pub use task_tracker::TaskTracker;
