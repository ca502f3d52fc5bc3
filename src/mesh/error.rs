use std::{io, net::SocketAddr};

use super::{node::NodeId, wire::HandshakeMessage};

/// Failure to bring a node's listener up.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("could not resolve {host}:{port}")]
    Unresolvable { host: String, port: u16 },
    #[error("address {addr} is already in use")]
    AddrInUse { addr: SocketAddr },
    #[error("could not bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    pub(crate) fn from_io(addr: SocketAddr, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::AddrInUse => Self::AddrInUse { addr },
            _ => Self::Io { addr, source },
        }
    }
}

/// Failure to establish an outbound link to a peer.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("could not resolve {host}:{port} for node {peer}")]
    Unresolvable { peer: NodeId, host: String, port: u16 },
    #[error("node {peer} at {addr} is unreachable: {source}")]
    Unreachable {
        peer: NodeId,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("handshake with node {peer} failed: {source}")]
    Handshake {
        peer: NodeId,
        #[source]
        source: HandshakeError,
    },
    #[error("handshake with node {peer} timed out")]
    TimedOut { peer: NodeId },
    #[error("node {id} cannot connect to itself")]
    SelfConnection { id: NodeId },
    #[error("already connected to node {peer}")]
    AlreadyConnected { peer: NodeId },
}

/// Failure while exchanging handshake frames on an open stream.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("handshake frame of {0} bytes exceeds the frame limit")]
    MessageLengthOverflowed(u32),
    #[error("could not encode handshake frame")]
    CouldNotEncodeMessage,
    #[error("could not decode handshake frame")]
    CouldNotDecodeMessage,
    #[error("unexpected handshake message {0:?}")]
    ReceivedBadHandshakeMessage(HandshakeMessage),
    #[error("node {0} refused the link")]
    Refused(NodeId),
    #[error("expected node {expected} but node {got} answered")]
    PeerIdMismatch { expected: NodeId, got: NodeId },
}

/// Errors surfaced by cluster bootstrap. The first failing node or pair aborts
/// the whole startup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("{count} nodes starting at port {base_port} do not fit in the port range")]
    PortRangeOverflow { base_port: u16, count: usize },
    #[error("node {node} saw {links} of {expected} peers before the mesh timeout")]
    MeshIncomplete {
        node: NodeId,
        links: usize,
        expected: usize,
    },
}
