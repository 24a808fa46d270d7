use crate::client::DfsClient;
use crate::test_cluster::{TestCluster, TEST_TOKEN};
use dfs_lib::{
    AccessToken, DfsClientConfig, DfsError, ReplaceDatanodePolicy, ReplicaRevocation,
    StaticTokenProvider,
};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT_LOGGER: Once = Once::new();

fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn new_client(
    cluster: &Arc<TestCluster>,
    customize: impl FnOnce(&mut DfsClientConfig),
) -> DfsClient {
    init_logging();
    let config = Arc::new(cluster.config(customize));
    DfsClient::new(
        config,
        cluster.clone(),
        cluster.clone(),
        Arc::new(StaticTokenProvider::new(AccessToken(TEST_TOKEN.to_string()))),
    )
    .unwrap()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8).collect()
}

fn use_local_sockets(cluster: &TestCluster) {
    for i in 0..cluster.storage_nodes().len() {
        cluster.set_domain_socket(i, "/var/run/dfs/dn.sock");
    }
}

#[tokio::test]
async fn test_multi_block_write_then_read() {
    let cluster = TestCluster::new(3);
    let client = new_client(&cluster, |c| {
        c.block_size = 2048;
        c.write_packet_size = 1032;
    });

    let data = payload(5000);
    let mut writer = client.create("/data/multi").await.unwrap();
    for chunk in data.chunks(700) {
        writer.write(chunk).await.unwrap();
    }
    assert_eq!(writer.pos(), 5000);
    writer.close().await.unwrap();
    assert!(cluster.is_complete("/data/multi"));

    let located = cluster.located_blocks("/data/multi");
    assert_eq!(located.blocks.len(), 3);
    assert_eq!(located.file_length, 5000);
    assert_eq!(located.blocks[1].offset, 2048);

    assert_eq!(client.read("/data/multi", 0, 5000).await.unwrap(), data);
    assert_eq!(
        client.read("/data/multi", 1000, 2500).await.unwrap(),
        &data[1000..3500]
    );
    // past the end returns what is there
    assert_eq!(
        client.read("/data/multi", 4900, 500).await.unwrap(),
        &data[4900..]
    );
    assert!(client.read("/data/multi", 6000, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_midstream_failure_keeps_data_intact() {
    let cluster = TestCluster::new(5);
    let client = new_client(&cluster, |c| {
        c.write_packet_size = 1032;
        c.block_write.replace_datanode_on_failure.policy = ReplaceDatanodePolicy::Always;
    });

    let data = payload(30_000);
    let mut writer = client.create("/data/recovered").await.unwrap();
    writer.write(&data[..1000]).await.unwrap();
    let first_nodes = writer.pipeline_nodes();
    assert_eq!(first_nodes.len(), 3);
    cluster.fail_node_on_packet(&first_nodes[2], 5);

    for chunk in data[1000..].chunks(1500) {
        writer.write(chunk).await.unwrap();
    }
    writer.close().await.unwrap();

    let excluded = client.excluded_nodes();
    assert!(excluded.iter().any(|n| n.same_node(&first_nodes[2])));
    let located = cluster.located_blocks("/data/recovered");
    assert_eq!(located.blocks[0].locations.len(), 3);
    assert!(!located.blocks[0]
        .locations
        .iter()
        .any(|n| n.same_node(&first_nodes[2])));
    assert_eq!(client.read("/data/recovered", 0, 30_000).await.unwrap(), data);
}

#[tokio::test]
async fn test_short_circuit_reads_share_one_handshake() {
    let cluster = TestCluster::new(3);
    use_local_sockets(&cluster);
    let data = payload(4096);
    cluster.create_file("/local", &data).await;
    cluster.set_handshake_delay(Duration::from_millis(30));
    let client = new_client(&cluster, |c| c.short_circuit.enabled = true);

    let (a, b) = tokio::join!(
        client.read("/local", 0, 2048),
        client.read("/local", 2048, 2048),
    );
    assert_eq!(a.unwrap(), &data[..2048]);
    assert_eq!(b.unwrap(), &data[2048..]);
    assert_eq!(cluster.handshakes(), 1);
    for node in cluster.storage_nodes() {
        assert_eq!(cluster.reads(&node), 0);
    }
}

#[tokio::test]
async fn test_revoked_replica_falls_back_to_network() {
    let cluster = TestCluster::new(3);
    use_local_sockets(&cluster);
    let data = payload(1500);
    cluster.create_file("/local", &data).await;
    let client = new_client(&cluster, |c| c.short_circuit.enabled = true);
    let node = cluster.located_blocks("/local").blocks[0].locations[0].clone();
    let block_id = cluster.located_blocks("/local").blocks[0].block.block_id;

    assert_eq!(client.read("/local", 0, 1500).await.unwrap(), data);
    let manager = client.short_circuit().unwrap().clone();
    assert_eq!(manager.cached_count(), 1);

    cluster.fail_handshakes(&node, true);
    manager
        .revocation_sender()
        .send(ReplicaRevocation {
            node: node.clone(),
            block_id,
        })
        .await
        .unwrap();
    for _ in 0..100 {
        if manager.cached_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(manager.cached_count(), 0);

    assert_eq!(client.read("/local", 0, 1500).await.unwrap(), data);
    assert_eq!(cluster.handshakes(), 2);
    assert_eq!(cluster.reads(&node), 1);
}

#[tokio::test(start_paused = true)]
async fn test_block_acquire_refetches_locations() {
    let cluster = TestCluster::new(3);
    let data = payload(800);
    cluster.create_file("/flaky", &data).await;
    for node in cluster.storage_nodes() {
        cluster.fail_reads(&node, 1);
    }
    let client = new_client(&cluster, |_| {});

    assert_eq!(client.read("/flaky", 0, 800).await.unwrap(), data);
    assert_eq!(cluster.metadata_calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_block_acquire_gives_up_after_bound() {
    let cluster = TestCluster::new(3);
    cluster.create_file("/lost", &payload(100)).await;
    for node in cluster.storage_nodes() {
        cluster.fail_reads(&node, u32::MAX);
    }
    let client = new_client(&cluster, |_| {});

    let err = client.read("/lost", 0, 100).await.unwrap_err();
    assert!(matches!(err, DfsError::Network(_)));
    // first lookup plus one refetch per tolerated failure
    assert_eq!(cluster.metadata_calls().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_hedged_read_through_client() {
    let cluster = TestCluster::new(3);
    let data = payload(600);
    cluster.create_file("/hedged", &data).await;
    let located = cluster.located_blocks("/hedged");
    cluster.set_read_delay(&located.blocks[0].locations[0], Duration::from_millis(800));
    let client = new_client(&cluster, |c| c.hedged_read.threadpool_size = 4);

    assert_eq!(client.read("/hedged", 0, 600).await.unwrap(), data);
    let metrics = client.hedged_read_metrics();
    assert_eq!(metrics.ops, 1);
    assert_eq!(metrics.wins, 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_waits_for_complete() {
    let cluster = TestCluster::new(3);
    let client = new_client(&cluster, |_| {});
    cluster.inject_incomplete_responses(2);

    let mut writer = client.create("/slow-close").await.unwrap();
    writer.write(b"some bytes").await.unwrap();
    writer.close().await.unwrap();
    assert!(cluster.is_complete("/slow-close"));
    assert!(writer.write(b"more").await.is_err());
}

#[tokio::test]
async fn test_metadata_failover_is_transparent() {
    let cluster = TestCluster::new(3);
    cluster.set_endpoint_down("nn1:8020", true);
    let client = new_client(&cluster, |_| {});

    let data = payload(3000);
    let mut writer = client.create("/failover").await.unwrap();
    writer.write(&data).await.unwrap();
    writer.close().await.unwrap();
    assert_eq!(client.read("/failover", 0, 3000).await.unwrap(), data);
    assert_eq!(client.metadata().failover().current_endpoint().host, "nn2");
}

#[tokio::test]
async fn test_invalid_setup_is_rejected() {
    let cluster = TestCluster::new(1);
    let no_endpoints = DfsClient::new(
        Arc::new(DfsClientConfig::default()),
        cluster.clone(),
        cluster.clone(),
        Arc::new(StaticTokenProvider::new(AccessToken::default())),
    );
    assert!(matches!(no_endpoints, Err(DfsError::InvalidConfig(_))));

    let client = new_client(&cluster, |_| {});
    assert!(client.create("relative/path").await.is_err());
}
