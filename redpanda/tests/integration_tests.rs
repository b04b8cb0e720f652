//! Integration tests for [`RedpandaEventBus`] against a real Kafka broker.
//!
//! These tests use testcontainers and validate:
//! - Branch completions survive the JSON envelope on the wire
//! - A coordinator consuming branch topics emits exactly one merged event,
//!   even when a branch is delivered twice
//! - A delivery dropped without an acknowledgement is redelivered to the next
//!   consumer in the group
//!
//! # Running These Tests
//!
//! Marked `#[ignore]`: they need Docker and take tens of seconds to start the
//! broker.
//!
//! ```bash
//! cargo test -p fanin-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use fanin_core::event::{BranchCompletion, MergedCompletion, SerializedEvent};
use fanin_core::event_bus::EventBus;
use fanin_core::instance_store::InstanceStore;
use fanin_redpanda::RedpandaEventBus;
use fanin_runtime::{Coordinator, FanInBarrier};
use fanin_testing::{InMemoryInstanceStore, branch, order_workflow, test_clock};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_broker() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn warmup_event() -> SerializedEvent {
    SerializedEvent::new("warmup".to_string(), b"{}".to_vec(), None)
}

/// Publish until the broker accepts, which also auto-creates `topic`.
async fn ensure_topic_exists(bus: &RedpandaEventBus, topic: &str) {
    for attempt in 1..=60 {
        if bus.publish(topic, &warmup_event()).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(2)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(attempt != 60, "Failed to create topic {topic}");
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn branch_completion_round_trip() {
    let (_kafka, brokers) = start_broker().await;
    let bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .consumer_group("round-trip")
        .build()
        .expect("Failed to create event bus");
    ensure_topic_exists(&bus, "order.validated").await;

    let mut stream = bus
        .subscribe(&["order.validated"])
        .await
        .expect("Failed to subscribe");

    let sent = branch("trace-1", "order.validated", serde_json::json!({"amount": 100}))
        .to_serialized()
        .unwrap();
    bus.publish("order.validated", &sent).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = stream.next().await.expect("stream ended").unwrap().into_event();
            if event.event_type != "warmup" {
                return event;
            }
        }
    })
    .await
    .expect("Timeout waiting for branch completion");

    assert_eq!(received, sent);
    let decoded = BranchCompletion::from_serialized(&received).unwrap();
    assert_eq!(decoded.correlation_id.as_str(), "trace-1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Docker"]
async fn coordinator_emits_one_merged_event_over_kafka() {
    let (_kafka, brokers) = start_broker().await;
    let bus = Arc::new(
        RedpandaEventBus::builder()
            .brokers(&brokers)
            .build()
            .expect("Failed to create event bus"),
    );
    for topic in ["inventory.checked", "order.validated", "order.ready"] {
        ensure_topic_exists(&bus, topic).await;
    }

    let mut coordinator = Coordinator::new(Arc::clone(&bus) as Arc<dyn EventBus>);
    coordinator
        .register(FanInBarrier::new(
            order_workflow(),
            Arc::new(InMemoryInstanceStore::new()) as Arc<dyn InstanceStore>,
            Arc::clone(&bus) as Arc<dyn EventBus>,
            Arc::new(test_clock()),
        ))
        .unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let running = tokio::spawn(Arc::new(coordinator).run(shutdown_rx));

    let downstream = RedpandaEventBus::builder()
        .brokers(&brokers)
        .consumer_group("downstream")
        .build()
        .unwrap();
    let mut merged = downstream.subscribe(&["order.ready"]).await.unwrap();

    let inventory = branch("trace-kafka", "inventory.checked", serde_json::json!({"allAvailable": true}));
    let validated = branch("trace-kafka", "order.validated", serde_json::json!({"amount": 100}));
    bus.publish("inventory.checked", &inventory.to_serialized().unwrap())
        .await
        .unwrap();
    bus.publish("order.validated", &validated.to_serialized().unwrap())
        .await
        .unwrap();
    // Redelivered branch.
    bus.publish("inventory.checked", &inventory.to_serialized().unwrap())
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = merged.next().await.expect("stream ended").unwrap().into_event();
            if event.event_type != "warmup" {
                return event;
            }
        }
    })
    .await
    .expect("Timeout waiting for merged completion");

    let completion = MergedCompletion::from_serialized(&first).unwrap();
    assert_eq!(completion.correlation_id.as_str(), "trace-kafka");
    assert_eq!(completion.payload["amount"], serde_json::json!(100));
    assert_eq!(completion.payload["readyForNextStage"], serde_json::json!(true));

    let second = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match merged.next().await {
                Some(Ok(delivery)) if delivery.event.event_type != "warmup" => {
                    return Some(delivery.into_event());
                },
                Some(Ok(delivery)) => delivery.ack(),
                Some(Err(_)) => {},
                None => return None,
            }
        }
    })
    .await;
    assert!(
        !matches!(second, Ok(Some(_))),
        "redelivered branch produced a second merged event: {second:?}"
    );

    shutdown_tx.send(true).unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unacknowledged_delivery_is_redelivered() {
    let (_kafka, brokers) = start_broker().await;
    let bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .consumer_group("redelivery")
        .build()
        .expect("Failed to create event bus");
    ensure_topic_exists(&bus, "order.validated").await;

    let sent = branch("trace-2", "order.validated", serde_json::json!({"amount": 5}))
        .to_serialized()
        .unwrap();
    bus.publish("order.validated", &sent).await.unwrap();

    let next_branch = |mut stream: fanin_core::event_bus::EventStream| async move {
        tokio::time::timeout(Duration::from_secs(30), async move {
            loop {
                let delivery = stream.next().await.expect("stream ended").unwrap();
                if delivery.event.event_type == "warmup" {
                    delivery.ack();
                } else {
                    return (delivery, stream);
                }
            }
        })
        .await
        .expect("Timeout waiting for branch completion")
    };

    let first = bus.subscribe(&["order.validated"]).await.unwrap();
    let (unsettled, first) = next_branch(first).await;
    assert_eq!(unsettled.event, sent);
    drop(unsettled);
    drop(first);
    // Let the group rebalance away from the abandoned consumer.
    tokio::time::sleep(Duration::from_secs(8)).await;

    let second = bus.subscribe(&["order.validated"]).await.unwrap();
    let (redelivered, _second) = next_branch(second).await;
    assert_eq!(redelivered.into_event(), sent);
}
