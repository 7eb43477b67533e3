//! Key routing through the producer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use partition_groups::group::InMemoryCoordinator;
use partition_groups::router::{PartitionRouter, murmur2, partition_for_key, to_positive};
use partition_groups::transport::{InMemoryBroker, MessageTransport};
use partition_groups::{Error, Message, MessageProducer};

#[test]
fn test_partition_matches_kafka_default_partitioner() {
    // toPositive(murmur2("foobar")) % 10, as Kafka's DefaultPartitioner computes it
    let expected = to_positive(-790332482) % 10;
    assert_eq!(partition_for_key("foobar", 10), expected);
    assert_eq!(murmur2(b""), 275646681);
}

#[test]
fn test_random_keys_spread_over_all_partitions() {
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for _ in 0..10_000 {
        let key = format!("key-{}", fastrand::u64(..));
        *counts.entry(partition_for_key(&key, 8)).or_default() += 1;
    }
    assert_eq!(counts.len(), 8);
    for (partition, count) in counts {
        assert!(
            (800..=1700).contains(&count),
            "partition {partition} got {count} of 10000"
        );
    }
}

#[tokio::test]
async fn test_equal_keys_share_a_channel() {
    let coord = InMemoryCoordinator::new();
    let broker = InMemoryBroker::new();
    let producer = MessageProducer::new(Arc::new(coord.clone()), Arc::new(broker.clone()));
    producer.declare_destination("orders", 4).await.unwrap();

    let mut channels = Vec::new();
    for i in 0..5 {
        let route = producer
            .send_message("orders", Message::new("customer-1", format!("v{i}")))
            .await
            .unwrap();
        channels.push(route.channel);
    }
    channels.dedup();
    assert_eq!(channels.len(), 1);

    // Broker keeps publish order within the channel
    for i in 0..5 {
        let delivery = broker
            .receive(&channels[0], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.payload, format!("v{i}"));
        broker.ack(&delivery).await.unwrap();
    }
}

#[tokio::test]
async fn test_router_reads_count_declared_by_consumer_side() {
    let coord = InMemoryCoordinator::new();
    partition_groups::group::CoordinationClient::declare_destination(&coord, "orders", 6)
        .await
        .unwrap();

    let router = PartitionRouter::new(Arc::new(coord));
    assert_eq!(router.partition_count("orders").await.unwrap(), 6);
    assert_eq!(
        router.route("missing", "k").await.unwrap_err(),
        Error::UnknownDestination("missing".to_string())
    );
}
