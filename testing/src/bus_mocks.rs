//! In-memory event bus for tests.
//!
//! Each topic is a tokio broadcast channel. Every publish is also appended
//! to a log so tests can assert on what went out without subscribing first.
//! Deliveries carry no acknowledgement; there is no offset to commit.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use fanin_core::event::SerializedEvent;
use fanin_core::event_bus::{Delivery, EventBus, EventBusError, EventStream};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const CHANNEL_CAPACITY: usize = 1024;

/// In-memory publish/subscribe transport.
///
/// Subscribers only see events published after they subscribed. Use
/// [`InMemoryEventBus::wait_for_subscribers`] before publishing from a test.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventBus {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<SerializedEvent>>>>,
    published: Arc<RwLock<Vec<(String, SerializedEvent)>>>,
    fail_publishes: Arc<AtomicBool>,
}

impl InMemoryEventBus {
    /// Create a bus with no topics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail (or succeed again).
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Every successful publish, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, SerializedEvent)> {
        self.published.read().unwrap().clone()
    }

    /// Successful publishes to `topic`, in order.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<SerializedEvent> {
        self.published
            .read()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Current number of subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap()
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Wait until `topic` has at least `count` subscribers.
    pub async fn wait_for_subscribers(&self, topic: &str, count: usize) {
        while self.subscriber_count(topic) < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<SerializedEvent> {
        if let Some(sender) = self.topics.read().unwrap().get(topic) {
            return sender.clone();
        }
        self.topics
            .write()
            .unwrap()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let result = if self.fail_publishes.load(Ordering::SeqCst) {
            Err(EventBusError::PublishFailed {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            })
        } else {
            self.published
                .write()
                .unwrap()
                .push((topic.to_string(), event.clone()));
            // No subscribers is not an error; the log still records the publish.
            let _ = self.sender(topic).send(event.clone());
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let receivers: Vec<(String, broadcast::Receiver<SerializedEvent>)> = topics
            .iter()
            .map(|topic| ((*topic).to_string(), self.sender(topic).subscribe()))
            .collect();

        Box::pin(async move {
            let streams = receivers.into_iter().map(|(topic, mut rx)| {
                Box::pin(async_stream::stream! {
                    loop {
                        match rx.recv().await {
                            Ok(event) => yield Ok(Delivery::new(event)),
                            Err(RecvError::Lagged(skipped)) => {
                                yield Err(EventBusError::TransportError(format!(
                                    "subscriber on '{topic}' lagged by {skipped} events"
                                )));
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                })
            });
            let merged: EventStream = Box::pin(futures::stream::select_all(streams));
            Ok(merged)
        })
    }
}
