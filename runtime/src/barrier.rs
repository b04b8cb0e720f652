//! The fan-in barrier for one workflow type.
//!
//! Every arrival is a read-modify-write of one instance record:
//!
//! 1. load the record (or open a fresh one on first arrival)
//! 2. apply the pure transition [`WorkflowInstance::apply_arrival`]
//! 3. write back with [`InstanceStore::compare_and_swap`]
//! 4. on a version conflict, go back to 1
//!
//! Because a completing write only commits against the exact version it was
//! computed from, two writers racing on the last missing branch cannot both
//! commit `Open → Completed`. The loser reloads, sees a completed instance,
//! and reports [`BarrierOutcome::AlreadyCompleted`] or
//! [`BarrierOutcome::DuplicateIgnored`].

use crate::metrics::BarrierMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use fanin_core::environment::Clock;
use fanin_core::event::{BranchCompletion, MergedCompletion};
use fanin_core::event_bus::EventBus;
use fanin_core::instance_store::InstanceStore;
use fanin_core::payload::merge_payloads;
use fanin_core::{
    BarrierError, BranchTag, CorrelationId, InstanceKey, Payload, Transition, WorkflowDefinition,
    WorkflowInstance,
};
use chrono::TimeDelta;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a publisher's emission claim blocks other publishers.
pub const DEFAULT_EMISSION_LEASE: Duration = Duration::from_secs(30);

/// Result of recording one branch arrival.
#[derive(Clone, Debug, PartialEq)]
pub enum BarrierOutcome {
    /// The branch had already been recorded; the first payload stands.
    DuplicateIgnored,
    /// The instance completed before this arrival; nothing changed.
    AlreadyCompleted,
    /// Recorded; other branches are still outstanding.
    AwaitingMore {
        /// Branches recorded so far, including this one.
        arrived: Vec<BranchTag>,
        /// Branches still outstanding.
        missing: Vec<BranchTag>,
    },
    /// This arrival completed the instance. Only one caller ever sees this.
    ReadyToEmit(Payload),
}

impl BarrierOutcome {
    /// Metric label for this outcome.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::DuplicateIgnored => "duplicate_ignored",
            Self::AlreadyCompleted => "already_completed",
            Self::AwaitingMore { .. } => "awaiting_more",
            Self::ReadyToEmit(_) => "ready_to_emit",
        }
    }
}

/// Result of [`FanInBarrier::retry_emission`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmissionRetry {
    /// The merged event was published and the instance marked emitted.
    Emitted,
    /// The instance is still open, its event was already published, or
    /// another publisher holds a live claim.
    NothingToDo,
}

/// Durable N-of-M barrier for one [`WorkflowDefinition`].
///
/// Cheap to clone; all collaborators are shared.
#[derive(Clone)]
pub struct FanInBarrier {
    definition: Arc<WorkflowDefinition>,
    store: Arc<dyn InstanceStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    contention: RetryPolicy,
    emission_lease: TimeDelta,
}

impl FanInBarrier {
    /// Create a barrier for `definition`.
    #[must_use]
    pub fn new(
        definition: WorkflowDefinition,
        store: Arc<dyn InstanceStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            definition: Arc::new(definition),
            store,
            bus,
            clock,
            contention: RetryPolicy::contention(),
            emission_lease: lease_delta(DEFAULT_EMISSION_LEASE),
        }
    }

    /// Replace the policy used to retry compare-and-set conflicts.
    #[must_use]
    pub fn with_contention_policy(mut self, policy: RetryPolicy) -> Self {
        self.contention = policy;
        self
    }

    /// Replace how long an emission claim is honoured before another
    /// publisher may take it over.
    ///
    /// A publisher that crashes between claiming and marking the instance
    /// emitted delays its event by at most this long.
    #[must_use]
    pub fn with_emission_lease(mut self, lease: Duration) -> Self {
        self.emission_lease = lease_delta(lease);
        self
    }

    /// Workflow this barrier coordinates.
    #[must_use]
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    fn key_for(&self, correlation_id: &CorrelationId) -> InstanceKey {
        InstanceKey::new(
            self.definition.workflow_type().clone(),
            correlation_id.clone(),
        )
    }

    /// Record that `branch_tag` finished for `correlation_id`.
    ///
    /// Never waits for other branches. The first payload recorded for a tag
    /// is authoritative; later deliveries of the same tag change nothing.
    ///
    /// # Errors
    ///
    /// - `InvalidCorrelationId`: blank correlation id
    /// - `UnknownBranchTag`: the workflow does not declare `branch_tag`
    /// - `StoreUnavailable`: the store failed, or conflicts outlasted the
    ///   contention policy; nothing was written
    pub async fn record_arrival(
        &self,
        correlation_id: &CorrelationId,
        branch_tag: &BranchTag,
        payload: Payload,
    ) -> Result<BarrierOutcome, BarrierError> {
        let workflow_type = self.definition.workflow_type();

        if correlation_id.as_str().trim().is_empty() {
            BarrierMetrics::record_error("invalid_correlation_id");
            return Err(BarrierError::InvalidCorrelationId);
        }

        if !self.definition.declares(branch_tag) {
            tracing::error!(
                workflow_type = %workflow_type,
                correlation_id = %correlation_id,
                branch_tag = %branch_tag,
                "Branch tag not declared by workflow"
            );
            BarrierMetrics::record_error("unknown_branch_tag");
            return Err(BarrierError::UnknownBranchTag {
                workflow_type: workflow_type.clone(),
                branch_tag: branch_tag.clone(),
            });
        }

        let start = Instant::now();
        let payload = &payload;
        let result = retry_with_predicate(
            &self.contention,
            move || self.try_record(correlation_id, branch_tag, payload),
            |err| matches!(err, BarrierError::StoreUnavailable(e) if e.is_conflict()),
        )
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                if err.is_transient() {
                    tracing::warn!(
                        workflow_type = %workflow_type,
                        correlation_id = %correlation_id,
                        branch_tag = %branch_tag,
                        error = %err,
                        "Failed to record branch arrival"
                    );
                } else {
                    tracing::error!(
                        workflow_type = %workflow_type,
                        correlation_id = %correlation_id,
                        branch_tag = %branch_tag,
                        error = %err,
                        "Branch arrival rejected"
                    );
                }
                BarrierMetrics::record_error(err.kind());
                return Err(err);
            }
        };

        BarrierMetrics::record_arrival(outcome.label(), start.elapsed());

        match &outcome {
            BarrierOutcome::DuplicateIgnored => {
                tracing::debug!(
                    workflow_type = %workflow_type,
                    correlation_id = %correlation_id,
                    branch_tag = %branch_tag,
                    "Duplicate branch arrival ignored"
                );
            }
            BarrierOutcome::AlreadyCompleted => {
                tracing::debug!(
                    workflow_type = %workflow_type,
                    correlation_id = %correlation_id,
                    branch_tag = %branch_tag,
                    "Arrival for completed instance ignored"
                );
            }
            BarrierOutcome::AwaitingMore { arrived, missing } => {
                tracing::info!(
                    workflow_type = %workflow_type,
                    correlation_id = %correlation_id,
                    branch_tag = %branch_tag,
                    arrived = arrived.len(),
                    missing = ?missing,
                    "Branch recorded, waiting for remaining branches"
                );
            }
            BarrierOutcome::ReadyToEmit(_) => {
                tracing::info!(
                    workflow_type = %workflow_type,
                    correlation_id = %correlation_id,
                    branch_tag = %branch_tag,
                    "All branches arrived, instance completed"
                );
                BarrierMetrics::record_completion(workflow_type.as_str());
            }
        }

        Ok(outcome)
    }

    /// One load-apply-write attempt.
    async fn try_record(
        &self,
        correlation_id: &CorrelationId,
        branch_tag: &BranchTag,
        payload: &Payload,
    ) -> Result<BarrierOutcome, BarrierError> {
        let key = self.key_for(correlation_id);
        let now = self.clock.now();

        let mut instance = match self.store.load(&key).await? {
            Some(instance) => instance,
            None => WorkflowInstance::open(&self.definition, correlation_id.clone(), now),
        };

        let outcome =
            match instance.apply_arrival(branch_tag.clone(), payload.clone(), &self.definition, now) {
                Transition::Undeclared => {
                    return Err(BarrierError::UnknownBranchTag {
                        workflow_type: key.workflow_type,
                        branch_tag: branch_tag.clone(),
                    });
                }
                Transition::Duplicate => return Ok(BarrierOutcome::DuplicateIgnored),
                Transition::AlreadyCompleted => return Ok(BarrierOutcome::AlreadyCompleted),
                Transition::Recorded => BarrierOutcome::AwaitingMore {
                    arrived: instance.arrived.keys().cloned().collect(),
                    missing: instance.missing_branches(),
                },
                Transition::Completed(merged) => BarrierOutcome::ReadyToEmit(merged),
            };

        if let Err(err) = self.store.compare_and_swap(&instance).await {
            if err.is_conflict() {
                BarrierMetrics::record_conflict();
                tracing::debug!(key = %key, error = %err, "Conflict recording arrival, reloading");
            }
            return Err(err.into());
        }

        Ok(outcome)
    }

    /// Publish the merged event for a completed instance.
    ///
    /// Call only with the payload from [`BarrierOutcome::ReadyToEmit`] or the
    /// stored merge. The completing arrival already holds the emission claim;
    /// any other caller has to win it first. When the claim is held elsewhere
    /// or the event was already published, nothing is sent.
    ///
    /// A confirmed publish marks the instance emitted; a failed one leaves it
    /// `Pending` for [`FanInBarrier::retry_emission`].
    ///
    /// # Errors
    ///
    /// - `EmissionFailed`: the transport rejected the publish
    /// - `MalformedEvent`: the payload could not be encoded
    /// - `InstanceNotFound`: no record for `correlation_id`
    /// - `StoreUnavailable`: the claim could not be read or written
    pub async fn emit_merged(
        &self,
        correlation_id: &CorrelationId,
        merged: Payload,
    ) -> Result<(), BarrierError> {
        if self.claim_emission(correlation_id, true).await?.is_none() {
            tracing::debug!(
                workflow_type = %self.definition.workflow_type(),
                correlation_id = %correlation_id,
                "Emission claimed elsewhere or already published, skipping"
            );
            return Ok(());
        }
        self.publish_merged(correlation_id, merged).await
    }

    /// Take the emission claim for `correlation_id`.
    ///
    /// Returns the claimed instance, or `None` when another publisher holds a
    /// live claim or there is nothing left to publish. `completer` accepts the
    /// claim written by the completing arrival as already held.
    async fn claim_emission(
        &self,
        correlation_id: &CorrelationId,
        completer: bool,
    ) -> Result<Option<WorkflowInstance>, BarrierError> {
        let key = &self.key_for(correlation_id);

        retry_with_predicate(
            &self.contention,
            move || async move {
                let Some(mut instance) = self.store.load(key).await? else {
                    return Err(BarrierError::InstanceNotFound {
                        workflow_type: key.workflow_type.clone(),
                        correlation_id: key.correlation_id.clone(),
                    });
                };
                if completer && instance.held_by_completer() {
                    return Ok(Some(instance));
                }

                let now = self.clock.now();
                if !instance.claimable(now, self.emission_lease) {
                    return Ok(None);
                }

                instance.claim_emission(now);
                match self.store.compare_and_swap(&instance).await {
                    Ok(version) => {
                        instance.version = version;
                        Ok(Some(instance))
                    }
                    Err(err) => {
                        if err.is_conflict() {
                            BarrierMetrics::record_conflict();
                            tracing::debug!(key = %key, "Lost emission claim race, reloading");
                        }
                        Err(err.into())
                    }
                }
            },
            |err| matches!(err, BarrierError::StoreUnavailable(e) if e.is_conflict()),
        )
        .await
    }

    /// Publish under a held claim and record the result.
    async fn publish_merged(
        &self,
        correlation_id: &CorrelationId,
        merged: Payload,
    ) -> Result<(), BarrierError> {
        let workflow_type = self.definition.workflow_type();
        let topic = self.definition.output_topic();
        let event = MergedCompletion {
            workflow_type: workflow_type.clone(),
            correlation_id: correlation_id.clone(),
            payload: merged,
        }
        .to_serialized()?;

        match self.bus.publish(topic, &event).await {
            Ok(()) => {
                BarrierMetrics::record_emission(true);
                tracing::info!(
                    workflow_type = %workflow_type,
                    correlation_id = %correlation_id,
                    topic,
                    "Merged event published"
                );
                let now = self.clock.now();
                if let Err(err) = self
                    .update_emission(correlation_id, |instance| instance.mark_emitted(now))
                    .await
                {
                    // The claim lapses and the sweeper publishes again.
                    tracing::warn!(
                        workflow_type = %workflow_type,
                        correlation_id = %correlation_id,
                        error = %err,
                        "Published but failed to mark instance emitted"
                    );
                }
                Ok(())
            }
            Err(source) => {
                BarrierMetrics::record_emission(false);
                tracing::warn!(
                    workflow_type = %workflow_type,
                    correlation_id = %correlation_id,
                    topic,
                    error = %source,
                    "Failed to publish merged event, emission left pending"
                );
                let reason = source.to_string();
                if let Err(err) = self
                    .update_emission(correlation_id, |instance| {
                        instance.mark_emission_failed(reason.clone());
                    })
                    .await
                {
                    tracing::warn!(
                        workflow_type = %workflow_type,
                        correlation_id = %correlation_id,
                        error = %err,
                        "Failed to record emission failure"
                    );
                }
                Err(BarrierError::EmissionFailed {
                    correlation_id: correlation_id.clone(),
                    source,
                })
            }
        }
    }

    /// Apply an emission-state change with the same compare-and-set loop as arrivals.
    ///
    /// Skips instances that are no longer awaiting emission.
    async fn update_emission<F>(
        &self,
        correlation_id: &CorrelationId,
        apply: F,
    ) -> Result<(), BarrierError>
    where
        F: Fn(&mut WorkflowInstance),
    {
        let key = &self.key_for(correlation_id);
        let apply = &apply;

        retry_with_predicate(
            &self.contention,
            move || async move {
                let Some(mut instance) = self.store.load(key).await? else {
                    return Err(BarrierError::InstanceNotFound {
                        workflow_type: key.workflow_type.clone(),
                        correlation_id: key.correlation_id.clone(),
                    });
                };
                if !instance.awaiting_emission() {
                    return Ok(());
                }
                apply(&mut instance);
                self.store.compare_and_swap(&instance).await?;
                Ok(())
            },
            |err| matches!(err, BarrierError::StoreUnavailable(e) if e.is_conflict()),
        )
        .await
    }

    /// Record a delivered branch event and, if it completed the instance,
    /// publish the merged event.
    ///
    /// # Errors
    ///
    /// Any error from [`FanInBarrier::record_arrival`] or
    /// [`FanInBarrier::emit_merged`].
    pub async fn process(
        &self,
        completion: &BranchCompletion,
    ) -> Result<BarrierOutcome, BarrierError> {
        let outcome = self
            .record_arrival(
                &completion.correlation_id,
                &completion.branch_tag,
                completion.payload.clone(),
            )
            .await?;

        if let BarrierOutcome::ReadyToEmit(merged) = &outcome {
            self.emit_merged(&completion.correlation_id, merged.clone())
                .await?;
        }

        Ok(outcome)
    }

    /// Re-publish the stored merged event of a completed instance whose
    /// emission is still pending.
    ///
    /// Claims the emission first, so it never races the completing caller or
    /// another sweeper: a live claim held elsewhere yields
    /// [`EmissionRetry::NothingToDo`]. Never re-runs the merge when a stored
    /// merge exists and never changes the arrived set.
    ///
    /// # Errors
    ///
    /// - `InstanceNotFound`: no record for `correlation_id`
    /// - `StoreUnavailable`: the record could not be loaded or claimed
    /// - `EmissionFailed`: the publish failed again
    pub async fn retry_emission(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<EmissionRetry, BarrierError> {
        let Some(instance) = self.claim_emission(correlation_id, false).await? else {
            return Ok(EmissionRetry::NothingToDo);
        };

        let merged = instance
            .merged_payload
            .unwrap_or_else(|| merge_payloads(&instance.arrived, self.definition.priority()));

        tracing::info!(
            key = %instance.key,
            "Retrying emission of merged event"
        );
        self.publish_merged(correlation_id, merged).await?;
        Ok(EmissionRetry::Emitted)
    }
}

fn lease_delta(lease: Duration) -> TimeDelta {
    TimeDelta::from_std(lease).unwrap_or(TimeDelta::MAX)
}
