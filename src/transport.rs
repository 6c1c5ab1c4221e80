use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpStream;

/// How a transport was secured when it was accepted. The core only records
/// the negotiation outcome; handshakes happen outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureTransportKind {
    Insecure,
    Tls,
}

/// Metadata captured when a transport is accepted or dialed.
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub secure: SecureTransportKind,
    /// Negotiated application protocol (e.g. from ALPN), when any.
    pub protocol: Option<String>,
    pub opened_at: Instant,
}

/// An accepted or dialed byte-stream socket. Owned exclusively by one
/// pipeline and pinned to that pipeline's reactor; destroyed on pipeline
/// teardown.
#[derive(Debug)]
pub struct Transport {
    stream: TcpStream,
    info: TransportInfo,
}

impl Transport {
    /// Wrap a freshly accepted stream.
    pub fn accepted(
        stream: TcpStream,
        peer_addr: SocketAddr,
        secure: SecureTransportKind,
        protocol: Option<String>,
    ) -> anyhow::Result<Self> {
        let local_addr = stream.local_addr()?;
        Ok(Self {
            stream,
            info: TransportInfo {
                local_addr,
                peer_addr,
                secure,
                protocol,
                opened_at: Instant::now(),
            },
        })
    }

    /// Wrap an outbound stream dialed on the caller's reactor.
    pub fn dialed(stream: TcpStream) -> anyhow::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        Self::accepted(stream, peer_addr, SecureTransportKind::Insecure, None)
    }

    #[inline]
    pub fn info(&self) -> &TransportInfo {
        &self.info
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.info.local_addr
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.info.peer_addr
    }

    pub(crate) fn into_parts(self) -> (TcpStream, TransportInfo) {
        (self.stream, self.info)
    }

    pub(crate) fn from_parts(stream: TcpStream, info: TransportInfo) -> Self {
        Self { stream, info }
    }
}
