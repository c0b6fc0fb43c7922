//! Fan-out writes, hedged reads and aggregated streams over an in-process cluster

use ringkv::common::{ClientConfig, Op};
use ringkv::node::StorageProvider;
use ringkv::{Error, LocalCluster};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_write_read_delete_on_healthy_cluster() {
    let cluster = LocalCluster::with_nodes(3);
    let client = cluster.client(ClientConfig::default()).unwrap();

    let acks = client.write(b"c", b"k1", b"v1").await.unwrap();
    assert_eq!(acks.len(), 3);
    assert_eq!(acks.acknowledged(), 3);

    let value = client.read(b"c", b"k1").await.unwrap();
    assert_eq!(value.as_deref(), Some(&b"v1"[..]));

    let acks = client.delete(b"c", b"k1").await.unwrap();
    assert_eq!(acks.acknowledged(), 3);

    // Both nodes a read may contact must have forgotten the key.
    let replicas = client.replicas_for(b"c");
    for node in [replicas.primary().unwrap(), replicas.backup().unwrap()] {
        let storage = cluster.storage(node).unwrap();
        assert_eq!(storage.read(b"c", b"k1").unwrap(), None);
    }
    assert_eq!(client.read(b"c", b"k1").await.unwrap(), None);
}

#[tokio::test]
async fn test_every_replica_stores_the_write() {
    let cluster = LocalCluster::with_nodes(5);
    let client = cluster.client(ClientConfig::default()).unwrap();

    client.write(b"users", b"alice", b"a").await.unwrap();

    let replicas = client.replicas_for(b"users");
    assert_eq!(replicas.len(), 3);
    for node in cluster.nodes() {
        let stored = cluster.storage(&node).unwrap().read(b"users", b"alice").unwrap();
        if replicas.iter().any(|replica| replica == node) {
            assert_eq!(stored, Some(b"a".to_vec()));
        } else {
            assert_eq!(stored, None);
        }
    }
    assert_eq!(cluster.total_requests(Op::Write), 3);
}

#[tokio::test]
async fn test_write_with_refusing_replica_leaves_one_slot_absent() {
    let cluster = LocalCluster::with_nodes(3);
    let client = cluster.client(ClientConfig::default()).unwrap();
    let replicas = client.replicas_for(b"orders");
    cluster.set_reachable(replicas.get(2).unwrap(), false).unwrap();

    let acks = client.write(b"orders", b"k1", b"v1").await.unwrap();
    assert_eq!(acks.len(), 3);
    assert_eq!(acks.acknowledged(), 2);
    assert!(acks.slots()[0].is_some());
    assert!(acks.slots()[1].is_some());
    assert!(acks.slots()[2].is_none());
    assert_eq!(client.metrics().replica_failures.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_write_with_silent_replica_waits_for_the_deadline() {
    let cluster = LocalCluster::with_nodes(3);
    let config = ClientConfig::default();
    let timeout = config.request_timeout();
    let client = cluster.client(config).unwrap();

    // Warm the pool so the silent node keeps an open connection.
    client.write(b"orders", b"k0", b"v0").await.unwrap();
    let replicas = client.replicas_for(b"orders");
    cluster.set_reachable(replicas.get(1).unwrap(), false).unwrap();

    let start = Instant::now();
    let acks = client.write(b"orders", b"k1", b"v1").await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(acks.acknowledged(), 2);
    assert!(acks.slots()[1].is_none());
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(100));
    assert_eq!(client.metrics().requests_timed_out.get(), 1);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_write_pads_to_replication_factor() {
    let cluster = LocalCluster::with_nodes(2);
    let client = cluster.client(ClientConfig::default()).unwrap();

    let acks = client.write(b"c", b"k", b"v").await.unwrap();
    assert_eq!(acks.len(), 3);
    assert_eq!(acks.acknowledged(), 2);
    assert!(acks.slots()[2].is_none());
}

#[tokio::test(start_paused = true)]
async fn test_read_survives_primary_leaving_membership() {
    let cluster = LocalCluster::with_nodes(3);
    let config = ClientConfig::default();
    let bound = config.request_timeout() + config.hedge_delay();
    let client = cluster.client(config).unwrap();

    client.write(b"c", b"k1", b"v1").await.unwrap();
    let replicas = client.replicas_for(b"c");
    let primary = replicas.primary().unwrap().to_string();
    let backup = replicas.backup().unwrap().to_string();

    cluster.set_reachable(&primary, false).unwrap();
    cluster.deregister(&primary).unwrap();

    let start = Instant::now();
    let value = client.read(b"c", b"k1").await.unwrap();
    assert_eq!(value.as_deref(), Some(&b"v1"[..]));
    assert!(start.elapsed() <= bound);
    assert_eq!(cluster.requests(&primary, Op::Read), 0);
    assert_eq!(cluster.requests(&backup, Op::Read), 1);
}

#[tokio::test]
async fn test_read_missing_key_is_absent() {
    let cluster = LocalCluster::with_nodes(3);
    let client = cluster.client(ClientConfig::default()).unwrap();

    assert_eq!(client.read(b"c", b"nothing").await.unwrap(), None);
    assert_eq!(client.metrics().replica_failures.get(), 0);
}

#[tokio::test]
async fn test_read_with_no_reachable_replica_fails() {
    let cluster = LocalCluster::with_nodes(3);
    let client = cluster.client(ClientConfig::default()).unwrap();
    for node in cluster.nodes() {
        cluster.set_reachable(&node, false).unwrap();
    }

    let result = client.read(b"c", b"k").await;
    assert!(matches!(result, Err(Error::NodeUnavailable { .. })));
}

#[tokio::test]
async fn test_default_column_family_helpers() {
    let cluster = LocalCluster::with_nodes(3);
    let client = cluster.client(ClientConfig::default()).unwrap();

    client.write_default(b"k", b"v").await.unwrap();
    assert_eq!(
        client.read(b"default", b"k").await.unwrap().as_deref(),
        Some(&b"v"[..])
    );
    client.delete_default(b"k").await.unwrap();
    assert_eq!(client.read_default(b"k").await.unwrap(), None);
}

#[tokio::test]
async fn test_delete_column_family_on_every_replica() {
    let cluster = LocalCluster::with_nodes(3);
    let client = cluster.client(ClientConfig::default()).unwrap();
    client.write(b"sessions", b"a", b"1").await.unwrap();
    client.write(b"sessions", b"b", b"2").await.unwrap();

    let acks = client.delete_column_family(b"sessions").await.unwrap();
    assert_eq!(acks.acknowledged(), 3);
    for node in cluster.nodes() {
        let storage = cluster.storage(&node).unwrap();
        assert!(!storage.column_family_exists(b"sessions"));
    }
    assert_eq!(client.stream(b"sessions", None).await.unwrap().count(), 0);
}

#[tokio::test]
async fn test_stream_returns_records_in_key_order() {
    let cluster = LocalCluster::with_nodes(3);
    let client = cluster.client(ClientConfig::default()).unwrap();
    for key in [&b"b"[..], b"a", b"c"] {
        client.write(b"letters", key, key).await.unwrap();
    }

    let keys: Vec<_> = client
        .stream(b"letters", None)
        .await
        .unwrap()
        .map(|record| record.key)
        .collect();
    assert_eq!(keys, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);

    let from_b: Vec<_> = client
        .stream(b"letters", Some(&b"b"[..]))
        .await
        .unwrap()
        .map(|record| record.value)
        .collect();
    assert_eq!(from_b, vec![&b"b"[..], &b"c"[..]]);
}

#[tokio::test]
async fn test_aggregated_stream_concatenates_members() {
    let cluster = LocalCluster::with_nodes(3);
    let client = cluster.client(ClientConfig::default()).unwrap();
    for (i, node) in cluster.nodes().iter().enumerate() {
        let storage = cluster.storage(node).unwrap();
        storage
            .write(b"events", format!("key-{}", i).as_bytes(), node.as_bytes())
            .unwrap();
    }

    let aggregated = client.aggregated_stream(Some(&b"events"[..]), None).await.unwrap();
    assert_eq!(aggregated.contributors(), 3);
    assert_eq!(aggregated.dropped(), 0);

    let mut values: Vec<_> = aggregated.map(|record| record.value).collect();
    values.sort();
    assert_eq!(values, vec![&b"node-0"[..], &b"node-1"[..], &b"node-2"[..]]);
}

#[tokio::test]
async fn test_aggregated_stream_drops_unreachable_member() {
    let cluster = LocalCluster::with_nodes(3);
    let client = cluster.client(ClientConfig::default()).unwrap();
    for node in cluster.nodes() {
        cluster
            .storage(&node)
            .unwrap()
            .write(b"default", node.as_bytes(), b"x")
            .unwrap();
    }
    cluster.set_reachable("node-1", false).unwrap();

    let aggregated = client.aggregated_stream(None, None).await.unwrap();
    assert_eq!(aggregated.contributors(), 2);
    assert_eq!(aggregated.dropped(), 1);
    assert_eq!(aggregated.count(), 2);
    assert_eq!(client.metrics().aggregate_members_dropped.get(), 1);
}

#[tokio::test]
async fn test_aggregated_stream_counts_empty_members_as_contributors() {
    let cluster = LocalCluster::with_nodes(3);
    let client = cluster.client(ClientConfig::default()).unwrap();
    cluster
        .storage("node-2")
        .unwrap()
        .write(b"sparse", b"k", b"v")
        .unwrap();

    let aggregated = client.aggregated_stream(Some(&b"sparse"[..]), None).await.unwrap();
    assert_eq!(aggregated.contributors(), 3);
    assert_eq!(aggregated.dropped(), 0);
    assert_eq!(aggregated.count(), 1);
}

#[tokio::test]
async fn test_membership_change_moves_placement() {
    let cluster = LocalCluster::with_nodes(3);
    let client = cluster.client(ClientConfig::default()).unwrap();
    assert_eq!(client.members().len(), 3);

    cluster.add_node("node-3");
    assert_eq!(client.members().len(), 4);
    assert_eq!(client.replicas_for(b"c").len(), 3);

    cluster.deregister("node-0").unwrap();
    cluster.deregister("node-1").unwrap();
    let replicas = client.replicas_for(b"c");
    assert_eq!(replicas.len(), 2);
    assert!(replicas.iter().all(|node| node != "node-0" && node != "node-1"));
}

#[tokio::test]
async fn test_close_discards_unflushed_appends() {
    let cluster = LocalCluster::with_nodes(3);
    let client = cluster.client(ClientConfig::default()).unwrap();
    client.append(b"series", b"v", None).await.unwrap();
    assert!(client.pending_append_bytes(b"series") > 0);

    client.close();
    assert_eq!(client.pending_append_bytes(b"series"), 0);
    assert_eq!(client.metrics().append_buffered_bytes.get(), 0);
    assert_eq!(cluster.total_requests(Op::TsWrite), 0);
}
