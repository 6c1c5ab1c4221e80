use crate::error::AcceptorError;
use crate::transport::Transport;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// A datagram delivered to the accept pipeline. The core does not interpret
/// it beyond handing it to the chain.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub buf: Bytes,
    pub peer: SocketAddr,
    pub socket: Arc<UdpSocket>,
}

/// Events flowing through an accept pipeline, one per accepted transport,
/// datagram, tracking change, or accept-path failure. Terminal handlers
/// pattern-match and silently drop kinds they do not recognize; upstream
/// handlers may intercept earlier in the chain.
#[derive(Debug)]
pub enum AcceptEvent {
    NewConnection(Transport),
    Datagram(Datagram),
    ConnAdded,
    ConnRemoved,
    Error(AcceptorError),
}
