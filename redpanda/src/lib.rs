//! Redpanda event bus for the fan-in barrier.
//!
//! Implements [`EventBus`] from `fanin-core` on top of rdkafka, so the same
//! coordinator runs against Redpanda, Apache Kafka or any Kafka-compatible
//! broker.
//!
//! # Topology
//!
//! ```text
//!  inventory.checked ─┐
//!                     ├──► Coordinator ──► FanInBarrier ──► order.ready
//!  order.validated  ──┘        (one consumer group)
//! ```
//!
//! # Partitioning
//!
//! Records are keyed by the envelope's `correlation_id`, so every branch of one
//! workflow instance lands on the same partition of its topic. Events without
//! a correlation id fall back to their event type as the key.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Each record reaches the subscriber as a [`Delivery`]; its offset is
//!   committed only after the subscriber acknowledged it and every earlier
//!   record
//! - A crash, or a delivery dropped unacknowledged, leaves the offset
//!   uncommitted and the record is redelivered; the barrier absorbs it as a
//!   duplicate arrival
//! - New consumer groups start from `earliest` so branch completions published
//!   before the coordinator joined are not skipped
//!
//! # Example
//!
//! ```no_run
//! use fanin_core::event::BranchCompletion;
//! use fanin_core::event_bus::EventBus;
//! use fanin_redpanda::RedpandaEventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::new("localhost:9092")?;
//!
//! let completion = BranchCompletion::new("trace-1", "order.validated", Default::default());
//! bus.publish("order.validated", &completion.to_serialized()?).await?;
//!
//! let mut stream = bus.subscribe(&["order.ready"]).await?;
//! while let Some(result) = stream.next().await {
//!     let event = result?.into_event();
//!     println!("merged: {:?}", event.correlation_id());
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use fanin_core::event::SerializedEvent;
use fanin_core::event_bus::{Delivery, EventBus, EventBusError, EventStream};
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{FuturesOrdered, StreamExt};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const DEFAULT_BUFFER_SIZE: usize = 1000;
const DEFAULT_OFFSET_RESET: &str = "earliest";
const DEFAULT_ACKS: &str = "all";
const CONSUMER_GROUP_PREFIX: &str = "fanin";

/// Encode an envelope as the record value.
///
/// # Errors
///
/// Returns [`EventBusError::PublishFailed`] if the envelope cannot be serialized.
pub fn encode_event(topic: &str, event: &SerializedEvent) -> Result<Vec<u8>, EventBusError> {
    serde_json::to_vec(event).map_err(|e| EventBusError::PublishFailed {
        topic: topic.to_string(),
        reason: format!("Failed to serialize event: {e}"),
    })
}

/// Decode a record value back into an envelope.
///
/// # Errors
///
/// Returns [`EventBusError::DeserializationFailed`] for bytes that are not a
/// JSON-encoded [`SerializedEvent`].
pub fn decode_event(bytes: &[u8]) -> Result<SerializedEvent, EventBusError> {
    serde_json::from_slice(bytes)
        .map_err(|e| EventBusError::DeserializationFailed(format!("Failed to deserialize event: {e}")))
}

/// Partition key for an envelope: its correlation id, else its event type.
#[must_use]
pub fn record_key(event: &SerializedEvent) -> String {
    event
        .correlation_id()
        .map_or_else(|| event.event_type.clone(), |cid| cid.as_str().to_string())
}

/// Consumer group derived from the subscribed topics.
///
/// Topics are sorted so that the same subscription always joins the same group.
#[must_use]
pub fn default_consumer_group(topics: &[String]) -> String {
    let mut sorted = topics.to_vec();
    sorted.sort();
    format!("{CONSUMER_GROUP_PREFIX}-{}", sorted.join("-"))
}

/// Kafka-compatible [`EventBus`].
///
/// Configured through [`RedpandaEventBus::builder`]:
/// - **Broker addresses**: bootstrap servers (required)
/// - **Producer settings**: acks (default `"all"`), compression, send timeout
/// - **Consumer group**: explicit id, or derived from the subscribed topics
/// - **Buffer size**: events held between the consumer and the subscriber
/// - **Offset reset**: where new groups start reading (default `"earliest"`)
///
/// # Example
///
/// ```no_run
/// use fanin_redpanda::RedpandaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .consumer_group("order-fan-in")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create an event bus with default settings.
    ///
    /// `brokers` is a comma-separated list such as `"localhost:9092"`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring an event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Bootstrap servers this bus connects to.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group used for a subscription to `topics`.
    #[must_use]
    pub fn consumer_group_for(&self, topics: &[String]) -> String {
        self.consumer_group
            .clone()
            .unwrap_or_else(|| default_consumer_group(topics))
    }
}

/// Builder for a [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`. A merged completion must not be acknowledged by the
    /// leader alone before the barrier marks it emitted.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"` or `"zstd"`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Explicit consumer group id.
    ///
    /// Coordinator replicas sharing a group split the branch topics' partitions
    /// between them.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Number of events buffered between the consumer and the subscriber.
    ///
    /// Zero is treated as one.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Where new consumer groups start reading: `"earliest"`, `"latest"` or `"error"`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if no brokers were set or the
    /// producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or(DEFAULT_ACKS);
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| DEFAULT_OFFSET_RESET.to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
            consumer_group: self.consumer_group,
            buffer_size,
            auto_offset_reset,
        })
    }
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let value = encode_event(&topic, &event)?;
            let key = record_key(&event);
            let record = FutureRecord::to(&topic).payload(&value).key(&key);

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        key = %key,
                        event_type = %event.event_type,
                        "Event published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        key = %key,
                        error = %kafka_error,
                        "Failed to publish event"
                    );
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let group_id = self.consumer_group_for(&topics);
        let brokers = self.brokers.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %group_id,
                buffer_size,
                auto_offset_reset = %auto_offset_reset,
                "Subscribed to topics"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);
            tokio::spawn(forward_messages(consumer, tx));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as EventStream)
        })
    }
}

/// Where a delivered record sits in its partition.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordPosition {
    topic: String,
    partition: i32,
    offset: i64,
}

/// Resolves once the subscriber has settled the record; `false` if the
/// delivery was dropped without an acknowledgement.
type PendingAck = BoxFuture<'static, (RecordPosition, bool)>;

fn pending_ack(position: RecordPosition, ack: oneshot::Receiver<()>) -> PendingAck {
    async move { (position, ack.await.is_ok()) }.boxed()
}

fn settled(position: RecordPosition) -> PendingAck {
    future::ready((position, true)).boxed()
}

/// Owns the consumer and feeds the subscriber's channel.
///
/// Every record is handed over as a [`Delivery`]. Offsets are committed in
/// delivery order, and only once every earlier record has been acknowledged.
/// A delivery dropped unacknowledged stops the loop so the uncommitted tail is
/// redelivered to the next consumer. Undecodable records count as settled.
async fn forward_messages(
    consumer: StreamConsumer,
    tx: tokio::sync::mpsc::Sender<Result<Delivery, EventBusError>>,
) {
    let mut stream = consumer.stream();
    let mut pending: FuturesOrdered<PendingAck> = FuturesOrdered::new();

    loop {
        tokio::select! {
            biased;

            Some((position, acked)) = pending.next(), if !pending.is_empty() => {
                if !acked {
                    tracing::warn!(
                        topic = %position.topic,
                        partition = position.partition,
                        offset = position.offset,
                        "Delivery dropped unacknowledged, stopping consumer"
                    );
                    break;
                }
                commit(&consumer, &position);
            }

            received = stream.next() => {
                let Some(received) = received else {
                    break;
                };
                let message = match received {
                    Ok(message) => message,
                    Err(e) => {
                        let err = EventBusError::TransportError(format!("Failed to receive message: {e}"));
                        if tx.send(Err(err)).await.is_err() {
                            break;
                        }
                        continue;
                    },
                };

                let position = RecordPosition {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                };
                let decoded = message.payload().map_or_else(
                    || Err(EventBusError::DeserializationFailed("Message has no payload".to_string())),
                    decode_event,
                );

                let (item, ack) = match decoded {
                    Ok(event) => {
                        tracing::trace!(
                            topic = %position.topic,
                            partition = position.partition,
                            offset = position.offset,
                            event_type = %event.event_type,
                            "Received event"
                        );
                        let (delivery, ack) = Delivery::with_ack(event);
                        (Ok(delivery), pending_ack(position, ack))
                    },
                    Err(err) => (Err(err), settled(position)),
                };

                if tx.send(item).await.is_err() {
                    tracing::debug!("Subscriber dropped, stopping consumer");
                    break;
                }
                pending.push_back(ack);
            }
        }
    }

    tracing::debug!(unsettled = pending.len(), "Consumer task exiting");
}

fn commit(consumer: &StreamConsumer, position: &RecordPosition) {
    let mut offsets = TopicPartitionList::new();
    let result = offsets
        .add_partition_offset(
            &position.topic,
            position.partition,
            Offset::Offset(position.offset + 1),
        )
        .and_then(|()| consumer.commit(&offsets, CommitMode::Async));

    if let Err(e) = result {
        tracing::warn!(
            topic = %position.topic,
            partition = position.partition,
            offset = position.offset,
            error = %e,
            "Failed to commit offset (message may be redelivered)"
        );
    }
}
