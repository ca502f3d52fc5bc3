use std::time::Duration;

use typed_builder::TypedBuilder;

use super::{DEFAULT_BASE_PORT, DEFAULT_HOST, DEFAULT_SERVER_COUNT};

/// Parameters for bringing up a mesh. Every field has a default, so
/// `MeshConfig::builder().build()` is the stock four node cluster on
/// 127.0.0.1:7000-7003.
#[derive(Debug, Clone, TypedBuilder)]
pub struct MeshConfig {
    /// How many nodes to start.
    #[builder(default = DEFAULT_SERVER_COUNT)]
    pub server_count: usize,
    /// Port of the first node. Node `i` listens on `base_port + i`.
    #[builder(default = DEFAULT_BASE_PORT)]
    pub base_port: u16,
    /// Host every node binds to and is dialed on.
    #[builder(default = DEFAULT_HOST.to_owned(), setter(into))]
    pub host: String,
    /// Upper bound on a single handshake, on either side of the link.
    #[builder(default = Duration::from_secs(5))]
    pub handshake_timeout: Duration,
    /// Upper bound on waiting for every node to see all of its peers once
    /// dialing has finished.
    #[builder(default = Duration::from_secs(10))]
    pub mesh_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MeshConfig {
    /// Port for the node at `index`, or `None` if it falls past `u16::MAX`.
    pub fn port_for(&self, index: usize) -> Option<u16> {
        let index = u16::try_from(index).ok()?;
        self.base_port.checked_add(index)
    }

    /// Last port the cluster will occupy, or `None` if the range overflows.
    /// An empty cluster occupies no ports and reports its base port.
    pub fn last_port(&self) -> Option<u16> {
        self.port_for(self.server_count.saturating_sub(1))
    }
}
