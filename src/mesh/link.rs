use std::{fmt, net::SocketAddr, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::net::TcpStream;

use super::node::NodeId;

/// Which end of the link opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We dialed the peer.
    Outbound,
    /// The peer dialed us.
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// A handshaken TCP connection between two nodes of the mesh.
///
/// Can be cloned to obtain another handle to the same stream.
#[derive(Clone)]
pub struct Link {
    peer: NodeId,
    remote_addr: SocketAddr,
    direction: Direction,
    established_at: DateTime<Utc>,
    stream: Arc<TcpStream>,
}

impl Link {
    pub(crate) fn new(
        peer: NodeId,
        remote_addr: SocketAddr,
        direction: Direction,
        stream: TcpStream,
    ) -> Self {
        Self {
            peer,
            remote_addr,
            direction,
            established_at: Utc::now(),
            stream: Arc::new(stream),
        }
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.peer)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("established_at", &self.established_at)
            .finish()
    }
}
