use std::process::ExitCode;

use meshboot::mesh::{Cluster, MeshConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let config = MeshConfig::default();
    info!(
        "starting {} nodes on {}:{}",
        config.server_count, config.host, config.base_port
    );

    let cluster = match Cluster::bootstrap(config).await {
        Ok(cluster) => cluster,
        Err(e) => {
            error!("bootstrap failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    for node in cluster.nodes() {
        info!(
            "node {} on {} has {} links",
            node.id(),
            node.local_addr(),
            node.link_count()
        );
    }
    for (from, to) in cluster.connections() {
        info!("node {} -> node {}", from, to);
    }
    cluster.shutdown().await;

    ExitCode::SUCCESS
}
