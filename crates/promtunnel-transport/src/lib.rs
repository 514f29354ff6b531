//! Transport abstraction layer for tunnel connections
//!
//! Core tunnel logic talks to agents through these traits; the only
//! implementation shipped is framed TCP ([`tcp`]), one connection per RPC.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   promtunnel-control / promtunnel-agent       │
//! └──────────────────────────────────────────────┘
//!                      │ uses traits
//!                      ↓
//! ┌──────────────────────────────────────────────┐
//! │  TransportListener → TransportStream          │
//! │        split() → MessageSender + MessageReceiver
//! └──────────────────────────────────────────────┘
//!                      │ implemented by
//!                      ↓
//! ┌──────────────────────────────────────────────┐
//! │  tcp: length-prefixed bincode frames          │
//! └──────────────────────────────────────────────┘
//! ```

pub mod tcp;

use async_trait::async_trait;
use promtunnel_proto::ProxyMessage;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;

pub use tcp::{TcpConnector, TcpRecvHalf, TcpSendHalf, TcpTransportListener, TcpTransportStream};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Sending side of a message stream
#[async_trait]
pub trait MessageSender: Send + Debug {
    /// Send a proxy message on this stream
    async fn send_message(&mut self, message: &ProxyMessage) -> TransportResult<()>;

    /// Close the sending side of the stream (half-close)
    async fn finish(&mut self) -> TransportResult<()>;
}

/// Receiving side of a message stream
#[async_trait]
pub trait MessageReceiver: Send + Debug {
    /// Receive a proxy message from this stream
    ///
    /// Returns `None` if the stream has been closed gracefully by the remote peer.
    /// Must be cancel safe: dropping the future never loses a partially read frame.
    async fn recv_message(&mut self) -> TransportResult<Option<ProxyMessage>>;
}

/// A bidirectional message stream carrying exactly one RPC
pub trait TransportStream: MessageSender + MessageReceiver {
    type SendHalf: MessageSender + 'static;
    type RecvHalf: MessageReceiver + 'static;

    /// Split into independently owned halves so each direction can run in its own task
    fn split(self) -> (Self::SendHalf, Self::RecvHalf);

    /// Get the remote peer address
    fn peer_addr(&self) -> SocketAddr;
}

/// Server-side: Listens for incoming transport streams
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// The stream type accepted by this listener
    type Stream: TransportStream + 'static;

    /// Accept an incoming stream
    ///
    /// Returns the stream and the remote address of the connecting peer.
    async fn accept(&self) -> TransportResult<(Self::Stream, SocketAddr)>;

    /// Get the local address this listener is bound to
    fn local_addr(&self) -> TransportResult<SocketAddr>;
}
