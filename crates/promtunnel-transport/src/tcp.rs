//! Framed TCP transport
//!
//! Each TCP connection carries one RPC as a sequence of
//! [`ProxyCodec`](promtunnel_proto::ProxyCodec) frames.

use crate::{
    MessageReceiver, MessageSender, TransportError, TransportListener, TransportResult,
    TransportStream,
};
use async_trait::async_trait;
use bytes::BytesMut;
use promtunnel_proto::{ProxyCodec, ProxyMessage};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::trace;

const READ_BUFFER_SIZE: usize = 8192;

/// Receiving half of a framed TCP stream
#[derive(Debug)]
pub struct TcpRecvHalf {
    read: OwnedReadHalf,
    recv_buffer: BytesMut,
    eof: bool,
}

impl TcpRecvHalf {
    fn new(read: OwnedReadHalf) -> Self {
        Self {
            read,
            recv_buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            eof: false,
        }
    }
}

#[async_trait]
impl MessageReceiver for TcpRecvHalf {
    async fn recv_message(&mut self) -> TransportResult<Option<ProxyMessage>> {
        loop {
            if let Some(msg) = ProxyCodec::decode(&mut self.recv_buffer)
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?
            {
                trace!("Received {} frame", msg.kind());
                return Ok(Some(msg));
            }

            if self.eof {
                if self.recv_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::ProtocolError(
                    "Incomplete message in buffer".to_string(),
                ));
            }

            // read_buf only commits bytes it actually read, so this is cancel safe
            let n = self.read.read_buf(&mut self.recv_buffer).await?;
            if n == 0 {
                self.eof = true;
            }
        }
    }
}

/// Sending half of a framed TCP stream
#[derive(Debug)]
pub struct TcpSendHalf {
    write: OwnedWriteHalf,
    finished: bool,
}

impl TcpSendHalf {
    fn new(write: OwnedWriteHalf) -> Self {
        Self {
            write,
            finished: false,
        }
    }
}

#[async_trait]
impl MessageSender for TcpSendHalf {
    async fn send_message(&mut self, message: &ProxyMessage) -> TransportResult<()> {
        if self.finished {
            return Err(TransportError::StreamClosed);
        }

        let encoded = ProxyCodec::encode(message)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        self.write.write_all(&encoded).await?;
        self.write.flush().await?;

        trace!("Sent {} frame", message.kind());
        Ok(())
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.write.shutdown().await?;
        Ok(())
    }
}

/// A framed TCP connection
#[derive(Debug)]
pub struct TcpTransportStream {
    send: TcpSendHalf,
    recv: TcpRecvHalf,
    peer_addr: SocketAddr,
}

impl TcpTransportStream {
    pub fn new(stream: TcpStream) -> TransportResult<Self> {
        let peer_addr = stream.peer_addr()?;
        // Frames are small and latency matters more than throughput here
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            send: TcpSendHalf::new(write),
            recv: TcpRecvHalf::new(read),
            peer_addr,
        })
    }
}

#[async_trait]
impl MessageSender for TcpTransportStream {
    async fn send_message(&mut self, message: &ProxyMessage) -> TransportResult<()> {
        self.send.send_message(message).await
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.send.finish().await
    }
}

#[async_trait]
impl MessageReceiver for TcpTransportStream {
    async fn recv_message(&mut self) -> TransportResult<Option<ProxyMessage>> {
        self.recv.recv_message().await
    }
}

impl TransportStream for TcpTransportStream {
    type SendHalf = TcpSendHalf;
    type RecvHalf = TcpRecvHalf;

    fn split(self) -> (Self::SendHalf, Self::RecvHalf) {
        (self.send, self.recv)
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

/// Accepts framed TCP connections from agents
#[derive(Debug)]
pub struct TcpTransportListener {
    listener: TcpListener,
}

impl TcpTransportListener {
    /// Bind a listener on the given address
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Wrap an already bound tokio listener
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener }
    }
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    type Stream = TcpTransportStream;

    async fn accept(&self) -> TransportResult<(Self::Stream, SocketAddr)> {
        let (stream, peer_addr) = self.listener.accept().await?;
        Ok((TcpTransportStream::new(stream)?, peer_addr))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Client-side: opens framed TCP connections to the proxy
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Connect to a remote proxy (host:port)
    pub async fn connect<A>(&self, addr: A) -> TransportResult<TcpTransportStream>
    where
        A: ToSocketAddrs + Send,
    {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        TcpTransportStream::new(stream)
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
