//! Event transport abstraction.
//!
//! Branches publish their completion on their own topic; the coordinator
//! subscribes to every branch topic its workflows declare and publishes one
//! merged event per completed instance on the workflow's output topic.
//!
//! ```text
//!  order.validated ──┐
//!                    ├──► Coordinator ──► FanInBarrier ──► order.ready
//! inventory.checked ─┘         │
//!                              ▼
//!                        InstanceStore
//! ```
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: an event may be delivered more than once
//! - **No cross-topic ordering**: branches arrive in any order
//! - Subscribers must be idempotent; the barrier is, per branch tag
//! - **Acknowledge after processing**: each [`Delivery`] is acknowledged by
//!   the subscriber once it is done with it. A broker-backed bus commits
//!   the record only then, so a delivery dropped unacknowledged (the
//!   subscriber stopped before the store recovered) is redelivered after a
//!   restart.
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (in `fanin-testing`): broadcast channels, failure injection
//! - `RedpandaEventBus` (in `fanin-redpanda`): Kafka-compatible production transport

use crate::event::SerializedEvent;
use futures::Stream;
use futures::channel::oneshot;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to connect to the event bus.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics.
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to deserialize a delivered message.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error.
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// One delivered event and its acknowledgement handle.
///
/// Dropping a delivery without calling [`Delivery::ack`] leaves it
/// unacknowledged.
#[derive(Debug)]
pub struct Delivery {
    /// The delivered envelope.
    pub event: SerializedEvent,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    /// A delivery from a transport with nothing to commit.
    #[must_use]
    pub const fn new(event: SerializedEvent) -> Self {
        Self { event, ack: None }
    }

    /// A delivery whose acknowledgement the transport waits for.
    ///
    /// The receiver resolves when the subscriber acknowledges and is
    /// cancelled when the delivery is dropped unacknowledged.
    #[must_use]
    pub fn with_ack(event: SerializedEvent) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                event,
                ack: Some(tx),
            },
            rx,
        )
    }

    /// Tell the transport this event is fully handled.
    pub fn ack(self) {
        if let Some(ack) = self.ack {
            // The transport may already have stopped; nothing left to commit then.
            let _ = ack.send(());
        }
    }

    /// Acknowledge and return the event, for subscribers that only read.
    #[must_use]
    pub fn into_event(mut self) -> SerializedEvent {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(());
        }
        self.event
    }
}

/// Stream of delivered events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Publish/subscribe transport for branch and merged events.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns keep the trait usable as
/// `Arc<dyn EventBus>`.
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics.
    ///
    /// The returned stream interleaves events from all topics with no ordering
    /// guarantee across topics.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    fn event() -> SerializedEvent {
        SerializedEvent::new("order.validated".to_string(), b"{}".to_vec(), None)
    }

    #[test]
    fn ack_resolves_the_transport_side() {
        let (delivery, mut acked) = Delivery::with_ack(event());

        delivery.ack();

        assert_eq!(acked.try_recv().unwrap(), Some(()));
    }

    #[test]
    fn dropped_delivery_is_not_acknowledged() {
        let (delivery, mut acked) = Delivery::with_ack(event());

        drop(delivery);

        assert!(acked.try_recv().is_err());
    }

    #[test]
    fn into_event_acknowledges() {
        let (delivery, mut acked) = Delivery::with_ack(event());

        let received = delivery.into_event();

        assert_eq!(received, event());
        assert_eq!(acked.try_recv().unwrap(), Some(()));
    }

    #[test]
    fn publish_failed_display_names_topic() {
        let err = EventBusError::PublishFailed {
            topic: "order.ready".to_string(),
            reason: "broker unreachable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Publish failed for topic 'order.ready': broker unreachable"
        );
    }
}
