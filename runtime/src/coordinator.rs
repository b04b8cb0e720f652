//! Routes delivered branch events to their workflow barriers.
//!
//! The coordinator subscribes to the union of every registered workflow's
//! branch topics and hands each delivered event to the barrier of every
//! workflow that declares its tag. Events are processed concurrently up to
//! `max_in_flight`.
//!
//! A delivery is acknowledged only once it is settled: recorded, or rejected
//! for a reason redelivery cannot fix (undecodable, undeclared tag). While
//! the store is unavailable the event is retried with the redelivery policy's
//! back-off for as long as the outage lasts. On shutdown a still-unsettled
//! delivery is dropped unacknowledged, so a broker-backed transport hands it
//! out again after restart.

use crate::barrier::{BarrierOutcome, FanInBarrier};
use crate::config::FanInConfig;
use crate::retry::{RetryPolicy, retry_with_predicate};
use fanin_core::environment::Clock;
use fanin_core::event::{BranchCompletion, SerializedEvent};
use fanin_core::event_bus::{Delivery, EventBus, EventBusError};
use fanin_core::instance_store::InstanceStore;
use fanin_core::{BarrierError, WorkflowType};
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

/// Errors that stop the coordinator.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// A second barrier was registered for the same workflow type.
    #[error("Workflow '{0}' is already registered")]
    DuplicateWorkflow(WorkflowType),

    /// `run` was called with no workflows registered.
    #[error("No workflows registered")]
    NoWorkflows,

    /// Subscribing to the branch topics failed.
    #[error("Subscription failed: {0}")]
    Subscription(#[from] EventBusError),
}

/// Subscription loop over every registered workflow's branch topics.
pub struct Coordinator {
    barriers: Vec<FanInBarrier>,
    bus: Arc<dyn EventBus>,
    redelivery: RetryPolicy,
    max_in_flight: usize,
}

impl Coordinator {
    /// Create a coordinator with no workflows.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            barriers: Vec::new(),
            bus,
            redelivery: RetryPolicy::default(),
            max_in_flight: 64,
        }
    }

    /// Build a coordinator with one barrier per configured workflow.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateWorkflow` if two workflows share a type.
    pub fn from_config(
        config: &FanInConfig,
        store: Arc<dyn InstanceStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoordinatorError> {
        let mut coordinator = Self::new(Arc::clone(&bus))
            .with_redelivery_policy(config.retry.clone())
            .with_max_in_flight(config.coordinator.max_in_flight);

        for definition in &config.workflows {
            coordinator.register(
                FanInBarrier::new(
                    definition.clone(),
                    Arc::clone(&store),
                    Arc::clone(&bus),
                    Arc::clone(&clock),
                )
                .with_emission_lease(config.sweeper.lease()),
            )?;
        }
        Ok(coordinator)
    }

    /// Replace the back-off used while the store is unavailable.
    #[must_use]
    pub fn with_redelivery_policy(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    /// Bound the number of events processed concurrently.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Add a barrier.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateWorkflow` if a barrier for the same workflow type
    /// is already registered.
    pub fn register(&mut self, barrier: FanInBarrier) -> Result<(), CoordinatorError> {
        let workflow_type = barrier.definition().workflow_type();
        if self.barrier(workflow_type).is_some() {
            return Err(CoordinatorError::DuplicateWorkflow(workflow_type.clone()));
        }
        tracing::info!(
            workflow_type = %workflow_type,
            branches = ?barrier.definition().priority(),
            output_topic = barrier.definition().output_topic(),
            "Registered fan-in workflow"
        );
        self.barriers.push(barrier);
        Ok(())
    }

    /// Barrier for `workflow_type`, if registered.
    #[must_use]
    pub fn barrier(&self, workflow_type: &WorkflowType) -> Option<&FanInBarrier> {
        self.barriers
            .iter()
            .find(|barrier| barrier.definition().workflow_type() == workflow_type)
    }

    /// All registered barriers.
    #[must_use]
    pub fn barriers(&self) -> &[FanInBarrier] {
        &self.barriers
    }

    /// Branch topics to subscribe to, sorted and de-duplicated.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.barriers
            .iter()
            .flat_map(|barrier| barrier.definition().priority())
            .map(ToString::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Process one delivered branch event.
    ///
    /// The event is applied to every workflow declaring its tag. Store
    /// outages are retried with the redelivery policy. All workflows are
    /// attempted even if one fails; the first error is returned.
    ///
    /// # Errors
    ///
    /// - `MalformedEvent`: the event could not be decoded
    /// - `UnknownBranchTag` (workflow `*`): no workflow declares the tag
    /// - any barrier error that outlasted the redelivery policy
    pub async fn handle_event(
        &self,
        event: &SerializedEvent,
    ) -> Result<Vec<(WorkflowType, BarrierOutcome)>, BarrierError> {
        let completion = BranchCompletion::from_serialized(event)?;

        let targets: Vec<&FanInBarrier> = self
            .barriers
            .iter()
            .filter(|barrier| barrier.definition().declares(&completion.branch_tag))
            .collect();

        if targets.is_empty() {
            tracing::error!(
                correlation_id = %completion.correlation_id,
                branch_tag = %completion.branch_tag,
                "No workflow declares branch tag"
            );
            return Err(BarrierError::UnknownBranchTag {
                workflow_type: WorkflowType::new("*"),
                branch_tag: completion.branch_tag,
            });
        }

        let mut outcomes = Vec::with_capacity(targets.len());
        let mut first_error = None;

        for barrier in targets {
            let completion = &completion;
            let result = retry_with_predicate(
                &self.redelivery,
                move || barrier.process(completion),
                BarrierError::is_transient,
            )
            .await;

            match result {
                Ok(outcome) => {
                    outcomes.push((barrier.definition().workflow_type().clone(), outcome));
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }

    /// Handle one delivery until it is settled, then acknowledge it.
    ///
    /// Transient failures are retried for as long as they last, sleeping the
    /// policy's `max_delay` between rounds. Returns `false` if `shutdown`
    /// fired first; the delivery is then dropped unacknowledged.
    pub async fn settle(&self, delivery: Delivery, mut shutdown: watch::Receiver<bool>) -> bool {
        let mut rounds: u64 = 0;
        loop {
            match self.handle_event(&delivery.event).await {
                Ok(_) => {
                    delivery.ack();
                    return true;
                }
                Err(err) if err.is_transient() => {
                    rounds += 1;
                    tracing::warn!(
                        event_type = %delivery.event.event_type,
                        rounds,
                        error = %err,
                        "Store still unavailable, holding branch event"
                    );
                    if *shutdown.borrow() {
                        break;
                    }
                    let stop = tokio::select! {
                        () = tokio::time::sleep(self.redelivery.max_delay) => false,
                        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
                    };
                    if stop {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(
                        event_type = %delivery.event.event_type,
                        error = %err,
                        kind = err.kind(),
                        "Branch event rejected"
                    );
                    delivery.ack();
                    return true;
                }
            }
        }

        tracing::warn!(
            event_type = %delivery.event.event_type,
            "Shutting down with branch event unsettled, leaving it unacknowledged"
        );
        false
    }

    /// Consume branch events until `shutdown` flips to `true` or the stream ends.
    ///
    /// In-flight events are drained before returning.
    ///
    /// # Errors
    ///
    /// Returns `NoWorkflows` if nothing is registered and `Subscription` if
    /// the bus refuses the subscription.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), CoordinatorError> {
        if self.barriers.is_empty() {
            return Err(CoordinatorError::NoWorkflows);
        }

        let topics = self.topics();
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        let mut stream = self.bus.subscribe(&topic_refs).await?;

        tracing::info!(
            topics = ?topics,
            max_in_flight = self.max_in_flight,
            "Coordinator started"
        );

        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks = JoinSet::new();

        loop {
            while tasks.try_join_next().is_some() {}

            tokio::select! {
                changed = shutdown.changed() => {
                    let stop = changed.is_err() || *shutdown.borrow();
                    if stop {
                        tracing::info!("Coordinator shutting down");
                        break;
                    }
                }
                next = stream.next() => {
                    let Some(delivery) = next else {
                        tracing::info!("Branch event stream ended");
                        break;
                    };
                    let delivery = match delivery {
                        Ok(delivery) => delivery,
                        Err(err) => {
                            tracing::warn!(error = %err, "Failed to receive branch event");
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        break;
                    };
                    let coordinator = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        coordinator.settle(delivery, shutdown).await;
                    });
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        tracing::info!("Coordinator stopped");
        Ok(())
    }
}
