//! Order fulfillment on top of the fan-in barrier.
//!
//! Two services work on every order in parallel: an inventory service
//! publishes `inventory.checked` and a validation service publishes
//! `order.validated`. The coordinator joins both into one `order.ready`
//! event per order, which a downstream consumer picks up.
//!
//! The inventory service deliberately publishes each result twice to show
//! that redelivery never produces a second `order.ready`.

use anyhow::Context;
use fanin_core::environment::{Clock, SystemClock};
use fanin_core::event::{BranchCompletion, MergedCompletion};
use fanin_core::event_bus::EventBus;
use fanin_core::instance_store::InstanceStore;
use fanin_core::{CorrelationId, Payload};
use fanin_runtime::{Coordinator, EmissionSweeper, FanInConfig};
use fanin_testing::{InMemoryEventBus, InMemoryInstanceStore};
use futures::StreamExt;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Built-in configuration used when `FANIN_CONFIG` is not set.
pub const DEFAULT_CONFIG: &str = include_str!("../config/order-processing.toml");

/// Load the configuration named by `FANIN_CONFIG`, or the built-in one.
///
/// # Errors
///
/// Returns an error if the file cannot be read or fails validation.
pub fn load_config() -> anyhow::Result<FanInConfig> {
    match std::env::var("FANIN_CONFIG") {
        Ok(path) => {
            tracing::info!(path = %path, "Loading configuration");
            FanInConfig::from_file(&path).with_context(|| format!("loading {path}"))
        },
        Err(_) => {
            tracing::info!("FANIN_CONFIG not set, using built-in order-processing config");
            Ok(FanInConfig::from_toml_str(DEFAULT_CONFIG)?)
        },
    }
}

/// Instance store and event bus the demo runs against.
pub struct Backends {
    /// Durable instance records.
    pub store: Arc<dyn InstanceStore>,
    /// Branch and merged event transport.
    pub bus: Arc<dyn EventBus>,
    in_memory_bus: Option<Arc<InMemoryEventBus>>,
}

impl Backends {
    /// In-process store and bus.
    #[must_use]
    pub fn in_memory() -> Self {
        let bus = Arc::new(InMemoryEventBus::new());
        Self {
            store: Arc::new(InMemoryInstanceStore::new()),
            bus: Arc::clone(&bus) as Arc<dyn EventBus>,
            in_memory_bus: Some(bus),
        }
    }

    /// Pick backends from `DATABASE_URL` and `REDPANDA_BROKERS`.
    ///
    /// Each variable is honoured only when the matching cargo feature is
    /// enabled; otherwise the in-memory implementation is used.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured backend cannot be reached.
    #[allow(clippy::unused_async)] // Awaits only with the postgres feature
    pub async fn from_env() -> anyhow::Result<Self> {
        #[cfg_attr(not(any(feature = "postgres", feature = "redpanda")), allow(unused_mut))]
        let mut backends = Self::in_memory();

        #[cfg(feature = "postgres")]
        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            let store = fanin_postgres::PostgresInstanceStore::new(&database_url)
                .await
                .context("connecting to PostgreSQL")?;
            store.migrate().await.context("running migrations")?;
            tracing::info!("Using PostgreSQL instance store");
            backends.store = Arc::new(store);
        }

        #[cfg(feature = "redpanda")]
        if let Ok(brokers) = std::env::var("REDPANDA_BROKERS") {
            let bus = fanin_redpanda::RedpandaEventBus::builder()
                .brokers(&brokers)
                .consumer_group("order-fulfillment")
                .build()
                .context("connecting to Redpanda")?;
            tracing::info!(brokers = %brokers, "Using Redpanda event bus");
            backends.bus = Arc::new(bus);
            backends.in_memory_bus = None;
        }

        Ok(backends)
    }

    /// Resolve once every topic has at least `count` subscribers.
    ///
    /// Broker-backed subscriptions start from the earliest offset, so only
    /// the in-memory bus needs to be waited on.
    async fn wait_until_subscribed(&self, topics: &[String], count: usize) {
        if let Some(bus) = &self.in_memory_bus {
            for topic in topics {
                bus.wait_for_subscribers(topic, count).await;
            }
        }
    }
}

/// Inventory service result for one order.
#[must_use]
pub fn inventory_result(order_id: &str) -> BranchCompletion {
    BranchCompletion::new(
        order_id,
        "inventory.checked",
        object(json!({
            "allAvailable": true,
            "warehouse": "eu-west-1",
            "status": "reserved",
        })),
    )
}

/// Validation service result for one order.
#[must_use]
pub fn validation_result(order_id: &str, amount_cents: u64) -> BranchCompletion {
    BranchCompletion::new(
        order_id,
        "order.validated",
        object(json!({
            "amountCents": amount_cents,
            "currency": "USD",
            "status": "validated",
        })),
    )
}

fn object(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}

async fn jitter() {
    let millis = rand::thread_rng().gen_range(5..40);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

async fn publish(bus: &dyn EventBus, completion: &BranchCompletion) -> anyhow::Result<()> {
    let event = completion.to_serialized()?;
    bus.publish(completion.branch_tag.as_str(), &event).await?;
    tracing::info!(
        correlation_id = %completion.correlation_id,
        branch_tag = %completion.branch_tag,
        "Branch completed"
    );
    Ok(())
}

async fn inventory_service(bus: Arc<dyn EventBus>, orders: Vec<String>) -> anyhow::Result<()> {
    for order_id in &orders {
        jitter().await;
        let result = inventory_result(order_id);
        publish(bus.as_ref(), &result).await?;
        // Simulated redelivery.
        publish(bus.as_ref(), &result).await?;
    }
    Ok(())
}

async fn validation_service(bus: Arc<dyn EventBus>, orders: Vec<String>) -> anyhow::Result<()> {
    for (i, order_id) in orders.iter().enumerate() {
        jitter().await;
        let amount = 1_000 * u64::try_from(i + 1).unwrap_or(u64::MAX / 1_000);
        publish(bus.as_ref(), &validation_result(order_id, amount)).await?;
    }
    Ok(())
}

/// Run `orders` orders through the barrier and return the merged events
/// received downstream, in arrival order.
///
/// # Errors
///
/// Returns an error if wiring fails, a branch cannot be published, or the
/// merged events do not all arrive within `timeout`.
pub async fn run(
    config: &FanInConfig,
    backends: &Backends,
    orders: usize,
    timeout: Duration,
) -> anyhow::Result<Vec<MergedCompletion>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let coordinator = Arc::new(Coordinator::from_config(
        config,
        Arc::clone(&backends.store),
        Arc::clone(&backends.bus),
        clock,
    )?);
    let sweeper = EmissionSweeper::for_coordinator(
        &coordinator,
        Arc::clone(&backends.store),
        config.sweeper.clone(),
    );

    let outputs: Vec<String> = config
        .workflows
        .iter()
        .map(|w| w.output_topic().to_string())
        .collect();
    let output_refs: Vec<&str> = outputs.iter().map(String::as_str).collect();
    let mut downstream = backends.bus.subscribe(&output_refs).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = JoinSet::new();
    {
        let coordinator = Arc::clone(&coordinator);
        let shutdown = shutdown_rx.clone();
        workers.spawn(async move {
            if let Err(err) = coordinator.run(shutdown).await {
                tracing::error!(error = %err, "Coordinator failed");
            }
        });
    }
    workers.spawn(sweeper.run(shutdown_rx));

    backends.wait_until_subscribed(&coordinator.topics(), 1).await;

    let order_ids: Vec<String> = (1..=orders).map(|n| format!("order-{n}")).collect();
    let mut producers = JoinSet::new();
    producers.spawn(inventory_service(Arc::clone(&backends.bus), order_ids.clone()));
    producers.spawn(validation_service(Arc::clone(&backends.bus), order_ids));
    while let Some(joined) = producers.join_next().await {
        joined??;
    }

    let received = tokio::time::timeout(timeout, async {
        let mut merged = Vec::with_capacity(orders);
        while merged.len() < orders {
            match downstream.next().await {
                Some(Ok(delivery)) => match MergedCompletion::from_serialized(&delivery.into_event()) {
                    Ok(completion) => {
                        tracing::info!(
                            correlation_id = %completion.correlation_id,
                            workflow_type = %completion.workflow_type,
                            "Order ready"
                        );
                        merged.push(completion);
                    },
                    Err(err) => tracing::warn!(error = %err, "Ignoring unexpected event"),
                },
                Some(Err(err)) => tracing::warn!(error = %err, "Downstream delivery error"),
                None => break,
            }
        }
        merged
    })
    .await
    .context("timed out waiting for merged orders")?;

    let _ = shutdown_tx.send(true);
    while workers.join_next().await.is_some() {}

    anyhow::ensure!(
        received.len() == orders,
        "expected {orders} merged orders, received {}",
        received.len()
    );
    Ok(received)
}

/// Correlation ids of `merged`, sorted.
#[must_use]
pub fn order_ids(merged: &[MergedCompletion]) -> Vec<CorrelationId> {
    let mut ids: Vec<CorrelationId> = merged.iter().map(|m| m.correlation_id.clone()).collect();
    ids.sort();
    ids
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn built_in_config_declares_the_order_workflow() {
        let config = FanInConfig::from_toml_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.workflows.len(), 1);
        let workflow = &config.workflows[0];
        assert_eq!(workflow.workflow_type().as_str(), "order-processing");
        assert_eq!(workflow.priority()[0].as_str(), "inventory.checked");
        assert_eq!(workflow.output_topic(), "order.ready");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_order_becomes_ready_exactly_once() {
        let config = FanInConfig::from_toml_str(DEFAULT_CONFIG).unwrap();
        let backends = Backends::in_memory();

        let merged = run(&config, &backends, 3, Duration::from_secs(10))
            .await
            .unwrap();

        let ids: Vec<String> = order_ids(&merged)
            .into_iter()
            .map(|id| id.as_str().to_string())
            .collect();
        assert_eq!(ids, ["order-1", "order-2", "order-3"]);

        for completion in &merged {
            assert_eq!(completion.payload["status"], json!("reserved"));
            assert_eq!(completion.payload["currency"], json!("USD"));
            assert_eq!(completion.payload["readyForNextStage"], json!(true));
        }

        let bus = backends.in_memory_bus.as_ref().unwrap();
        assert_eq!(bus.published_to("order.ready").len(), 3);
        assert_eq!(bus.published_to("inventory.checked").len(), 6);
    }
}
