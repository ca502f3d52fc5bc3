use futures::future::join_all;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    config::MeshConfig,
    error::Error,
    node::{Node, NodeId, NodeIdAllocator},
};

/// Number of links in a full mesh of `n` nodes.
pub fn expected_connections(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

/// A fixed set of nodes on contiguous ports. Node `i` has id `i` and listens
/// on `base_port + i`.
#[derive(Debug)]
pub struct Cluster {
    nodes: Vec<Node>,
    config: MeshConfig,
}

impl Cluster {
    /// Brings up a full mesh: binds every node, connects every pair and waits
    /// until each node has seen all of its peers. Any failure aborts the whole
    /// startup and shuts down the nodes created so far, so their ports are free
    /// again when the error comes back.
    pub async fn bootstrap(config: MeshConfig) -> Result<Self, Error> {
        let span = info_span!(
            "bootstrap",
            nodes = config.server_count,
            base_port = config.base_port
        );
        async move {
            let cluster = Self::initiate_servers(config).await?;
            let connections = match cluster.connect_servers().await {
                Ok(connections) => connections,
                Err(e) => {
                    cluster.shutdown().await;
                    return Err(e);
                }
            };
            if let Err(e) = cluster.await_mesh().await {
                cluster.shutdown().await;
                return Err(e);
            }
            info!("mesh ready with {} connections", connections);
            Ok(cluster)
        }
        .instrument(span)
        .await
    }

    /// Creates `server_count` nodes on ports `base_port..base_port + n`.
    ///
    /// Ids are handed out in port order before any socket is touched; the
    /// binds then run concurrently and all of them must succeed. Every node
    /// is listening by the time this returns. On failure the first error in
    /// port order is returned, after every node that did bind has been shut
    /// down.
    pub async fn initiate_servers(config: MeshConfig) -> Result<Self, Error> {
        let count = config.server_count;
        if config.last_port().is_none() {
            return Err(Error::PortRangeOverflow {
                base_port: config.base_port,
                count,
            });
        }

        let mut ids = NodeIdAllocator::new();
        let mut pending = Vec::with_capacity(count);
        for index in 0..count {
            let id = ids.next_id();
            let port = config.port_for(index).ok_or(Error::PortRangeOverflow {
                base_port: config.base_port,
                count,
            })?;
            pending.push(Node::create(
                id,
                &config.host,
                port,
                config.handshake_timeout,
            ));
        }

        let mut nodes = Vec::with_capacity(count);
        let mut failure = None;
        for created in join_all(pending).await {
            match created {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            warn!("startup aborted, releasing {} bound nodes: {}", nodes.len(), e);
            join_all(nodes.into_iter().map(Node::shutdown)).await;
            return Err(e.into());
        }
        debug!("{} nodes listening", nodes.len());
        Ok(Self { nodes, config })
    }

    /// Connects every pair of nodes exactly once, the higher id dialing the
    /// lower one, in ascending order of the lower id. Returns how many
    /// connections were made. Stops at the first failure.
    pub async fn connect_servers(&self) -> Result<usize, Error> {
        let mut connections = 0;
        for (i, lower) in self.nodes.iter().enumerate() {
            let target = lower.info();
            for higher in &self.nodes[i + 1..] {
                higher.connect_to(&target).await?;
                debug!("node {} -> node {}", higher.id(), lower.id());
                connections += 1;
            }
        }
        Ok(connections)
    }

    /// Waits until every node has recorded a link to each of its peers. The
    /// dialing side records its link before `connect_servers` returns, the
    /// accepting side may lag behind by a few handshakes.
    pub async fn await_mesh(&self) -> Result<(), Error> {
        let expected = self.nodes.len().saturating_sub(1);
        for node in &self.nodes {
            if !node.wait_for_links(expected, self.config.mesh_timeout).await {
                return Err(Error::MeshIncomplete {
                    node: node.id(),
                    links: node.link_count(),
                    expected,
                });
            }
        }
        Ok(())
    }

    /// Shuts every node down and waits until all of their listeners are
    /// closed. Dropping the cluster instead only aborts the acceptors, and the
    /// ports may stay bound for a moment afterwards.
    pub async fn shutdown(self) {
        join_all(self.nodes.into_iter().map(Node::shutdown)).await;
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id() == id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Every connection as `(initiator, acceptor)`, sorted. Read from the
    /// dialing side, so it is complete as soon as `connect_servers` returns.
    pub fn connections(&self) -> Vec<(NodeId, NodeId)> {
        let mut connections = Vec::new();
        for node in &self.nodes {
            for peer in node.outbound_peers() {
                connections.push((node.id(), peer));
            }
        }
        connections.sort_unstable();
        connections
    }

    /// The mesh as a directed graph, with an edge from the dialing node to
    /// the accepting node for every connection.
    pub fn topology(&self) -> DiGraphMap<NodeId, ()> {
        let mut graph = DiGraphMap::new();
        for node in &self.nodes {
            graph.add_node(node.id());
        }
        for (from, to) in self.connections() {
            graph.add_edge(from, to, ());
        }
        graph
    }
}
