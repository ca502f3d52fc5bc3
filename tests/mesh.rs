use hashbrown::HashSet;

use meshboot::mesh::{
    expected_connections, BindError, Cluster, Direction, Error, MeshConfig,
};

// Each test gets its own port block so they can run in parallel.

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(server_count: usize, base_port: u16) -> MeshConfig {
    MeshConfig::builder()
        .server_count(server_count)
        .base_port(base_port)
        .build()
}

#[tokio::test]
async fn four_nodes_form_the_expected_mesh() {
    init_tracing();
    let cluster = Cluster::initiate_servers(config(4, 47000)).await.unwrap();

    let ids: Vec<_> = cluster.nodes().iter().map(|n| n.id()).collect();
    let ports: Vec<_> = cluster.nodes().iter().map(|n| n.port()).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert_eq!(ports, vec![47000, 47001, 47002, 47003]);

    assert_eq!(cluster.connect_servers().await.unwrap(), 6);
    assert_eq!(
        cluster.connections(),
        vec![(1, 0), (2, 0), (2, 1), (3, 0), (3, 1), (3, 2)]
    );
}

#[tokio::test]
async fn every_pair_is_connected_once_for_small_clusters() {
    init_tracing();
    for n in 1..=6usize {
        let base_port = 47100 + 10 * n as u16;
        let cluster = Cluster::initiate_servers(config(n, base_port))
            .await
            .unwrap();
        assert_eq!(cluster.len(), n);
        for (index, node) in cluster.nodes().iter().enumerate() {
            assert_eq!(node.id() as usize, index);
            assert_eq!(node.port(), base_port + index as u16);
        }

        let made = cluster.connect_servers().await.unwrap();
        assert_eq!(made, expected_connections(n));

        let connections = cluster.connections();
        let unordered: HashSet<_> = connections
            .iter()
            .map(|&(a, b)| (a.min(b), a.max(b)))
            .collect();
        assert_eq!(unordered.len(), connections.len(), "duplicate pair");
        assert!(connections.iter().all(|(from, to)| from > to));
    }
}

#[tokio::test]
async fn bootstrap_records_links_on_both_ends() {
    init_tracing();
    let cluster = Cluster::bootstrap(config(5, 47200)).await.unwrap();

    for node in cluster.nodes() {
        let id = node.id();
        assert_eq!(node.link_count(), 4);
        assert_eq!(node.outbound_peers(), (0..id).collect::<Vec<_>>());
        assert_eq!(
            node.inbound_peers(),
            (id + 1..5).collect::<Vec<_>>()
        );
        for link in node.links() {
            let expected = if link.peer() < id {
                Direction::Outbound
            } else {
                Direction::Inbound
            };
            assert_eq!(link.direction(), expected);
        }
    }
}

#[tokio::test]
async fn topology_is_a_complete_graph_pointing_downwards() {
    init_tracing();
    let cluster = Cluster::bootstrap(config(4, 47300)).await.unwrap();
    let graph = cluster.topology();

    assert_eq!(graph.node_count(), 4);
    assert_eq!(graph.edge_count(), expected_connections(4));
    for (from, to, _) in graph.all_edges() {
        assert!(from > to);
    }
    for a in 0..4u32 {
        for b in 0..4u32 {
            if a != b {
                assert!(graph.contains_edge(a.max(b), a.min(b)));
            }
        }
        assert!(!graph.contains_edge(a, a));
    }
}

#[tokio::test]
async fn initiation_order_is_the_same_every_run() {
    init_tracing();
    let first = Cluster::bootstrap(config(4, 47400)).await.unwrap();
    let second = Cluster::bootstrap(config(4, 47410)).await.unwrap();
    assert_eq!(first.connections(), second.connections());
}

#[tokio::test]
async fn taken_base_port_aborts_the_whole_bootstrap() {
    init_tracing();
    let _squatter = std::net::TcpListener::bind(("127.0.0.1", 47500)).unwrap();

    match Cluster::bootstrap(config(4, 47500)).await {
        Err(Error::Bind(BindError::AddrInUse { addr })) => {
            assert_eq!(addr.port(), 47500);
        }
        other => panic!("expected the bootstrap to abort, got {:?}", other),
    }
}

#[tokio::test]
async fn aborted_startup_releases_the_ports_it_bound() {
    init_tracing();
    let squatter = std::net::TcpListener::bind(("127.0.0.1", 47702)).unwrap();
    assert!(Cluster::initiate_servers(config(4, 47700)).await.is_err());
    drop(squatter);

    let retry = Cluster::initiate_servers(config(4, 47700)).await.unwrap();
    assert_eq!(retry.len(), 4);
    retry.shutdown().await;
}

#[tokio::test]
async fn shutdown_frees_the_ports_for_the_next_bootstrap() {
    init_tracing();
    let first = Cluster::bootstrap(config(3, 47800)).await.unwrap();
    first.shutdown().await;

    let second = Cluster::bootstrap(config(3, 47800)).await.unwrap();
    assert_eq!(second.connections(), vec![(1, 0), (2, 0), (2, 1)]);
}

#[tokio::test]
async fn taken_port_in_the_middle_aborts_too() {
    init_tracing();
    let _squatter = std::net::TcpListener::bind(("127.0.0.1", 47602)).unwrap();

    let result = Cluster::initiate_servers(config(4, 47600)).await;
    assert!(matches!(
        result,
        Err(Error::Bind(BindError::AddrInUse { addr })) if addr.port() == 47602
    ));
}
