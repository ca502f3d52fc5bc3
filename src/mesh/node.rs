use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use hashbrown::{HashMap, HashSet};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::Notify,
    task::{JoinHandle, JoinSet},
    time::timeout,
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    error::{BindError, ConnectError, HandshakeError},
    link::{Direction, Link},
    resolve,
    wire::{self, HandshakeStream},
};

pub type NodeId = u32;

/// Hands out node ids in creation order, starting at 0. Owned by whoever is
/// creating the nodes; there is no global counter.
#[derive(Debug, Default)]
pub struct NodeIdAllocator {
    next: NodeId,
}

impl NodeIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> NodeId {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Where a node can be dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

/// Established links plus the peers a handshake is currently in flight with,
/// in either direction. A peer id sits in at most one of `links`, `dialing`
/// and `accepting` at a time, except for the instant between an outbound link
/// being stored and its dial reservation being released.
#[derive(Default)]
struct PeerTable {
    links: HashMap<NodeId, Link>,
    dialing: HashSet<NodeId>,
    accepting: HashSet<NodeId>,
}

impl PeerTable {
    fn is_taken(&self, peer: NodeId) -> bool {
        self.links.contains_key(&peer)
            || self.dialing.contains(&peer)
            || self.accepting.contains(&peer)
    }

    /// Decides whether an inbound hello from `peer` may proceed and reserves
    /// the peer if so. When both ends dial each other at once the dial from the
    /// lower id wins.
    fn admit(&mut self, us: NodeId, peer: NodeId) -> bool {
        if self.links.contains_key(&peer) || self.accepting.contains(&peer) {
            return false;
        }
        if self.dialing.contains(&peer) && us < peer {
            return false;
        }
        self.accepting.insert(peer);
        true
    }
}

type Peers = Arc<Mutex<PeerTable>>;

/// Critical sections on the table are a few map operations and never await.
fn lock(peers: &Mutex<PeerTable>) -> MutexGuard<'_, PeerTable> {
    peers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds a peer in the dialing set until dropped, so a cancelled or failed
/// dial never leaves the peer reserved.
struct DialReservation<'a> {
    peers: &'a Mutex<PeerTable>,
    peer: NodeId,
}

impl Drop for DialReservation<'_> {
    fn drop(&mut self) {
        lock(self.peers).dialing.remove(&self.peer);
    }
}

/// A member of the mesh: one listening socket plus the links it holds to its
/// peers, keyed by peer id.
///
/// Links are recorded on both ends. The dialing node stores an outbound link
/// and the accepting node stores an inbound one once the handshake finishes.
/// Dropping the node aborts its acceptor; `shutdown` does the same and also
/// waits until the listening socket is closed.
pub struct Node {
    id: NodeId,
    host: String,
    local_addr: SocketAddr,
    peers: Peers,
    link_added: Arc<Notify>,
    acceptor: Option<JoinHandle<()>>,
    handshake_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
enum InboundError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("handshake timed out")]
    TimedOut,
    #[error("peer claimed our own id")]
    SelfConnection,
    #[error("already linked to node {0}")]
    AlreadyConnected(NodeId),
}

impl Node {
    /// Binds `host:port` and starts accepting peers in the background. This
    /// returns as soon as the listener is up; it does not wait for anyone to
    /// connect.
    ///
    /// Passing port 0 lets the OS pick a port, which `port()` then reports.
    pub async fn create(
        id: NodeId,
        host: &str,
        port: u16,
        handshake_timeout: Duration,
    ) -> Result<Self, BindError> {
        let addr = resolve(host, port).await.ok_or_else(|| {
            BindError::Unresolvable {
                host: host.to_owned(),
                port,
            }
        })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BindError::from_io(addr, e))?;
        let local_addr =
            listener.local_addr().map_err(|e| BindError::from_io(addr, e))?;
        debug!(node = id, %local_addr, "listening");

        let peers = Arc::new(Mutex::new(PeerTable::default()));
        let link_added = Arc::new(Notify::new());
        let acceptor = tokio::spawn(
            Self::start_acceptor(
                id,
                listener,
                peers.clone(),
                link_added.clone(),
                handshake_timeout,
            )
            .instrument(debug_span!("acceptor", node = id)),
        );

        Ok(Self {
            id,
            host: host.to_owned(),
            local_addr,
            peers,
            link_added,
            acceptor: Some(acceptor),
            handshake_timeout,
        })
    }

    /// Stops accepting and waits for the listener to be closed, so the port
    /// can be bound again as soon as this returns. In-flight inbound
    /// handshakes are cancelled with it.
    pub async fn shutdown(mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
            // resolves once the task, and the listener it owns, are dropped
            let _ = acceptor.await;
        }
        debug!(node = self.id, "shut down");
    }

    /// Accepts incoming peers and handshakes with each one in its own task.
    /// Runs until the node is shut down, so it lives in a dedicated task; the
    /// handshake tasks are owned by it and go away with it.
    async fn start_acceptor(
        id: NodeId,
        listener: TcpListener,
        peers: Peers,
        link_added: Arc<Notify>,
        handshake_timeout: Duration,
    ) {
        let mut handshakes = JoinSet::new();
        loop {
            select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            continue;
                        }
                    };
                    trace!(%remote_addr, "accepted tcp connection");
                    let peers = peers.clone();
                    let link_added = link_added.clone();
                    handshakes.spawn(
                        async move {
                            let handshake = Self::respond(
                                id,
                                stream,
                                remote_addr,
                                &peers,
                                handshake_timeout,
                            );
                            match handshake.await {
                                Ok(peer) => {
                                    link_added.notify_waiters();
                                    debug!("recorded inbound link from node {}", peer);
                                }
                                Err(InboundError::AlreadyConnected(peer)) => {
                                    debug!("refused duplicate link from node {}", peer)
                                }
                                Err(e) => warn!("rejected inbound connection: {}", e),
                            }
                        }
                        .instrument(debug_span!("inbound", remote = %remote_addr)),
                    );
                }
                Some(_) = handshakes.join_next() => {}
            }
        }
    }

    /// Responder side of the handshake. The peer is reserved in the table
    /// before the welcome goes out and only becomes a link once it has been
    /// sent; the table is never locked across the network I/O.
    async fn respond(
        id: NodeId,
        stream: TcpStream,
        remote_addr: SocketAddr,
        peers: &Mutex<PeerTable>,
        handshake_timeout: Duration,
    ) -> Result<NodeId, InboundError> {
        let mut hs = HandshakeStream::new(stream);
        let (peer, listen_port) =
            timeout(handshake_timeout, wire::receive_hello(&mut hs))
                .await
                .map_err(|_| InboundError::TimedOut)??;
        trace!("node {} says hello, listening on port {}", peer, listen_port);
        if peer == id {
            return Err(InboundError::SelfConnection);
        }

        let admitted = lock(peers).admit(id, peer);
        if !admitted {
            // a failed send only means the dialer has already gone
            let _ = timeout(handshake_timeout, wire::send_refusal(&mut hs, id)).await;
            return Err(InboundError::AlreadyConnected(peer));
        }

        let sent = timeout(handshake_timeout, wire::send_welcome(&mut hs, id)).await;
        let mut table = lock(peers);
        table.accepting.remove(&peer);
        match sent {
            Ok(Ok(())) => {
                table.links.insert(
                    peer,
                    Link::new(peer, remote_addr, Direction::Inbound, hs.into_inner()),
                );
                Ok(peer)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(InboundError::TimedOut),
        }
    }

    /// Puts `peer` in the dialing set, or explains why we may not dial it.
    fn reserve_dial(&self, peer: NodeId) -> Result<DialReservation<'_>, ConnectError> {
        if peer == self.id {
            return Err(ConnectError::SelfConnection { id: self.id });
        }
        let mut table = lock(&self.peers);
        if table.is_taken(peer) {
            return Err(ConnectError::AlreadyConnected { peer });
        }
        table.dialing.insert(peer);
        Ok(DialReservation {
            peers: &self.peers,
            peer,
        })
    }

    /// Dials `peer`, runs the handshake and records an outbound link to it.
    ///
    /// If the peer is already linked, or a handshake with it is underway in
    /// either direction, this fails with `AlreadyConnected`. Two nodes dialing
    /// each other at the same time end up with exactly one link between them.
    pub async fn connect_to(&self, peer: &PeerInfo) -> Result<Link, ConnectError> {
        let span = debug_span!("connect", node = self.id, peer = peer.id);
        async move {
            let _reservation = self.reserve_dial(peer.id)?;

            let addr = resolve(&peer.host, peer.port).await.ok_or_else(|| {
                ConnectError::Unresolvable {
                    peer: peer.id,
                    host: peer.host.clone(),
                    port: peer.port,
                }
            })?;
            debug!(%addr, "dialing");
            let stream = TcpStream::connect(addr).await.map_err(|source| {
                ConnectError::Unreachable {
                    peer: peer.id,
                    addr,
                    source,
                }
            })?;

            let mut hs = HandshakeStream::new(stream);
            let handshake = wire::initiate(&mut hs, self.id, self.port(), peer.id);
            match timeout(self.handshake_timeout, handshake).await {
                Ok(Ok(())) => {}
                Ok(Err(HandshakeError::Refused(_))) => {
                    debug!("peer already holds a link to us");
                    return Err(ConnectError::AlreadyConnected { peer: peer.id });
                }
                Ok(Err(source)) => {
                    return Err(ConnectError::Handshake {
                        peer: peer.id,
                        source,
                    })
                }
                Err(_) => return Err(ConnectError::TimedOut { peer: peer.id }),
            }

            let link =
                Link::new(peer.id, addr, Direction::Outbound, hs.into_inner());
            {
                let mut table = lock(&self.peers);
                if table.links.contains_key(&peer.id) {
                    return Err(ConnectError::AlreadyConnected { peer: peer.id });
                }
                table.links.insert(peer.id, link.clone());
            }
            self.link_added.notify_waiters();
            debug!("handshake complete");
            Ok(link)
        }
        .instrument(span)
        .await
    }

    /// Resolves once at least `expected` links are recorded, or returns false
    /// if `deadline` passes first.
    pub async fn wait_for_links(&self, expected: usize, deadline: Duration) -> bool {
        let wait = async {
            loop {
                // register before checking so a link added in between still
                // wakes us
                let notified = self.link_added.notified();
                let linked = self.link_count();
                if linked >= expected {
                    return;
                }
                notified.await;
            }
        };
        timeout(deadline, wait).await.is_ok()
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            host: self.host.clone(),
            port: self.port(),
        }
    }

    pub fn link(&self, peer: NodeId) -> Option<Link> {
        lock(&self.peers).links.get(&peer).cloned()
    }

    pub fn links(&self) -> Vec<Link> {
        lock(&self.peers).links.values().cloned().collect()
    }

    pub fn link_count(&self) -> usize {
        lock(&self.peers).links.len()
    }

    /// Peers this node dialed, ascending.
    pub fn outbound_peers(&self) -> Vec<NodeId> {
        self.peers_by_direction(Direction::Outbound)
    }

    /// Peers that dialed this node, ascending.
    pub fn inbound_peers(&self) -> Vec<NodeId> {
        self.peers_by_direction(Direction::Inbound)
    }

    fn peers_by_direction(&self, direction: Direction) -> Vec<NodeId> {
        let mut peers: Vec<_> = lock(&self.peers)
            .links
            .values()
            .filter(|link| link.direction() == direction)
            .map(Link::peer)
            .collect();
        peers.sort_unstable();
        peers
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}
