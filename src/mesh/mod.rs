use std::net::{IpAddr, SocketAddr};

#[cfg(feature = "cluster")]
pub mod cluster;
pub mod config;
pub mod error;
pub mod link;
pub mod node;
pub mod wire;

pub use config::MeshConfig;
pub use error::{BindError, ConnectError, Error, HandshakeError};
pub use link::{Direction, Link};
pub use node::{Node, NodeId, NodeIdAllocator, PeerInfo};

#[cfg(feature = "cluster")]
pub use cluster::{expected_connections, Cluster};

/// Number of nodes started when no count is configured.
pub const DEFAULT_SERVER_COUNT: usize = 4;
/// Port of node 0; node `i` listens on `DEFAULT_BASE_PORT + i`.
pub const DEFAULT_BASE_PORT: u16 = 7000;
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Converts an IP address and port to a socket address.
fn ip_addr_to_socket_addr(ip: IpAddr, port: u16) -> SocketAddr {
    match ip {
        IpAddr::V4(ip) => SocketAddr::from((ip, port)),
        IpAddr::V6(ip) => SocketAddr::from((ip, port)),
    }
}

/// Resolves `host:port`, preferring a literal IP so that no DNS lookup happens
/// for the common loopback case.
async fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip_addr_to_socket_addr(ip, port));
    }
    tokio::net::lookup_host((host, port)).await.ok()?.next()
}
