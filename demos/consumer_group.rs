//! Consumer-group walkthrough on the in-memory backend and broker.
//!
//! Starts three consumers in one group, sends keyed messages, removes one
//! consumer mid-stream and prints who handled what.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example consumer_group --features test-utilities
//! ```
//!
//! With JSON logging and a different profile:
//! ```bash
//! LOG_FORMAT=json RUST_LOG=partition_groups=debug CONSUMER_PROFILE=dev \
//!     PARTITION_COUNT=6 cargo run --example consumer_group --features test-utilities
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use partition_groups::group::{InMemoryCoordinator, metrics};
use partition_groups::handler::handler_fn;
use partition_groups::telemetry::{LogFormat, init_logging};
use partition_groups::transport::InMemoryBroker;
use partition_groups::{
    ConsumerConfig, InMemoryDuplicateDetector, Message, MessageConsumer, MessageProducer,
    Subscription,
};
use tracing::info;

const DESTINATION: &str = "orders";
const SUBSCRIBER: &str = "billing";

type Tally = Arc<Mutex<BTreeMap<String, usize>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;
    metrics::init_metrics();

    let config = ConsumerConfig::from_env()?;
    let partition_count = config.partition_count;
    info!(partition_count, heartbeat_ms = config.heartbeat_interval.as_millis() as u64, "Starting demo");

    let coordinator = Arc::new(InMemoryCoordinator::new());
    let broker = Arc::new(InMemoryBroker::new());
    let producer = MessageProducer::new(coordinator.clone(), broker.clone());
    producer
        .declare_destination(DESTINATION, partition_count)
        .await?;

    let consumer = MessageConsumer::new(
        coordinator.clone(),
        broker.clone(),
        Arc::new(InMemoryDuplicateDetector::new()),
        config,
    );

    let tally: Tally = Arc::default();
    let mut subscriptions = Vec::new();
    for name in ["alpha", "bravo", "charlie"] {
        subscriptions.push(subscribe(&consumer, name, tally.clone()).await?);
    }
    wait_for_stable(&subscriptions, partition_count).await;
    print_ownership("three consumers", &subscriptions);

    for i in 0..60 {
        let key = format!("customer-{}", i % 12);
        producer
            .send_message(DESTINATION, Message::new(key, format!("order {i}")))
            .await?;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let leaving = subscriptions.remove(1);
    leaving.close().await?;
    wait_for_stable(&subscriptions, partition_count).await;
    print_ownership("after bravo left", &subscriptions);

    for i in 60..120 {
        let key = format!("customer-{}", i % 12);
        producer
            .send_message(DESTINATION, Message::new(key, format!("order {i}")))
            .await?;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    for subscription in &subscriptions {
        subscription.close().await?;
    }

    let tally = tally.lock().map_err(|_| "tally poisoned")?;
    println!("\nMessages handled per consumer:");
    for (name, count) in tally.iter() {
        println!("  {name:<8} {count}");
    }
    println!("  total    {}", tally.values().sum::<usize>());

    if let Err(violations) = coordinator.verify_exclusive().await {
        eprintln!("Lease exclusivity violated: {violations:?}");
    }
    Ok(())
}

async fn subscribe(
    consumer: &MessageConsumer,
    name: &'static str,
    tally: Tally,
) -> partition_groups::Result<Subscription> {
    consumer
        .subscribe(
            SUBSCRIBER,
            [DESTINATION],
            handler_fn(move |message: &Message| {
                if let Ok(mut tally) = tally.lock() {
                    *tally.entry(name.to_string()).or_default() += 1;
                }
                info!(
                    consumer = name,
                    key = %message.key,
                    partition = ?message.partition(),
                    "Handled message"
                );
                Ok(())
            }),
        )
        .await
}

async fn wait_for_stable(subscriptions: &[Subscription], partition_count: u32) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        let owned: usize = subscriptions
            .iter()
            .map(|s| s.owned_partitions().values().map(Vec::len).sum::<usize>())
            .sum();
        let size_ok = subscriptions.iter().all(|s| {
            s.member(DESTINATION)
                .is_some_and(|m| m.status().group_size == subscriptions.len())
        });
        if size_ok && owned == partition_count as usize {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn print_ownership(label: &str, subscriptions: &[Subscription]) {
    println!("\nOwnership {label}:");
    for subscription in subscriptions {
        for summary in subscription.summaries() {
            println!(
                "  {} {:?} owns {:?}",
                summary.member_id, summary.state, summary.owned
            );
        }
    }
}
