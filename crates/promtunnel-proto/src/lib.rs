//! Promtunnel Protocol Definitions
//!
//! Wire messages exchanged between the proxy and its agents, the scrape
//! request/result data types, and the length-prefixed frame codec.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, ProxyCodec};
pub use messages::*;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Default port agents dial to reach the proxy's tunnel listener
pub const DEFAULT_TUNNEL_PORT: u16 = 50051;

/// Default port of the proxy's HTTP front end
pub const DEFAULT_HTTP_PORT: u16 = 8080;
