//! Durable state of one workflow instance and its pure transition function.
//!
//! The barrier never mutates an instance in place in the store. It loads the
//! current record, computes the next state with [`WorkflowInstance::apply_arrival`],
//! and writes it back with a compare-and-set. Keeping the transition pure is what
//! lets a conflicting writer simply reload and re-apply.
//!
//! # State machine
//!
//! ```text
//! Open ──(last expected branch recorded)──► Completed
//!
//! emission (once Completed):
//!
//!   Publishing ──(publish ok)──► Emitted
//!     │    ▲
//!     │    └──(claim: CAS, or lease expired)──┐
//!     └──(publish failed)──► Pending ─────────┘
//! ```
//!
//! The completing write lands in `Publishing` with `completer: true`, so the
//! caller that completed the instance holds the first claim. Anyone else must
//! win a compare-and-set from `Pending`, or from a `Publishing` whose lease ran
//! out, before publishing.

use crate::correlation::{BranchTag, CorrelationId, InstanceKey, Version, WorkflowType};
use crate::payload::{merge_payloads, Payload};
use crate::workflow::WorkflowDefinition;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Coordination status of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Still waiting for at least one expected branch.
    Open,
    /// Every expected branch has arrived. Terminal.
    Completed,
}

impl InstanceStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completed => "completed",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Whether the merged event has reached the downstream topic.
///
/// Tracked separately from [`InstanceStatus`] so that a publish failure after
/// completion leaves a visible, retryable record instead of a silently stuck
/// instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EmissionState {
    /// The instance is still open; nothing to emit.
    NotReady,
    /// Completed, merged event not yet confirmed published.
    Pending {
        /// Failed publish attempts so far.
        attempts: u32,
        /// Last publish error, if any attempt failed.
        last_error: Option<String>,
    },
    /// Claimed by one publisher, publish not yet confirmed.
    Publishing {
        /// Failed publish attempts before this claim.
        attempts: u32,
        /// When the claim was taken.
        claimed_at: DateTime<Utc>,
        /// Whether the claim is the one written by the completing arrival.
        completer: bool,
    },
    /// Merged event published.
    Emitted {
        /// When the publish was confirmed.
        at: DateTime<Utc>,
    },
}

/// Durable record of one fan-in workflow instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Storage key.
    pub key: InstanceKey,
    /// Branches required for completion, fixed at creation.
    pub expected_branches: BTreeSet<BranchTag>,
    /// First payload recorded per branch.
    pub arrived: BTreeMap<BranchTag, Payload>,
    /// Coordination status.
    pub status: InstanceStatus,
    /// When the first branch arrived.
    pub created_at: DateTime<Utc>,
    /// When the last expected branch arrived.
    pub completed_at: Option<DateTime<Utc>>,
    /// Merge result, computed once at completion.
    pub merged_payload: Option<Payload>,
    /// Emission progress of the merged event.
    pub emission: EmissionState,
    /// Version of the stored record this value was loaded from.
    pub version: Version,
}

/// Result of applying one branch arrival to an instance.
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    /// The branch is not part of this instance's expected set; nothing changed.
    Undeclared,
    /// The branch was already recorded; nothing changed.
    Duplicate,
    /// The instance completed before this branch could matter; nothing changed.
    AlreadyCompleted,
    /// The branch was recorded; other branches are still missing.
    Recorded,
    /// The branch was the last one missing; the instance is now completed.
    Completed(Payload),
}

impl Transition {
    /// Whether the instance must be written back.
    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        matches!(self, Self::Recorded | Self::Completed(_))
    }
}

impl WorkflowInstance {
    /// A fresh, unsaved instance for `correlation_id` under `definition`.
    #[must_use]
    pub fn open(
        definition: &WorkflowDefinition,
        correlation_id: CorrelationId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: InstanceKey::new(definition.workflow_type().clone(), correlation_id),
            expected_branches: definition.expected_branches(),
            arrived: BTreeMap::new(),
            status: InstanceStatus::Open,
            created_at: now,
            completed_at: None,
            merged_payload: None,
            emission: EmissionState::NotReady,
            version: Version::INITIAL,
        }
    }

    /// Correlation id of this instance.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.key.correlation_id
    }

    /// Workflow type of this instance.
    #[must_use]
    pub const fn workflow_type(&self) -> &WorkflowType {
        &self.key.workflow_type
    }

    /// Expected branches that have not arrived yet.
    #[must_use]
    pub fn missing_branches(&self) -> Vec<BranchTag> {
        self.expected_branches
            .iter()
            .filter(|tag| !self.arrived.contains_key(*tag))
            .cloned()
            .collect()
    }

    /// Whether every expected branch has arrived.
    #[must_use]
    pub fn all_arrived(&self) -> bool {
        self.expected_branches
            .iter()
            .all(|tag| self.arrived.contains_key(tag))
    }

    /// Whether the instance completed but its merged event is not yet published.
    #[must_use]
    pub const fn awaiting_emission(&self) -> bool {
        matches!(self.status, InstanceStatus::Completed)
            && matches!(
                self.emission,
                EmissionState::Pending { .. } | EmissionState::Publishing { .. }
            )
    }

    /// Whether the completing arrival's own claim is still in place.
    #[must_use]
    pub const fn held_by_completer(&self) -> bool {
        matches!(self.emission, EmissionState::Publishing { completer: true, .. })
    }

    /// Whether a new publisher may claim the emission at `now`.
    ///
    /// `Pending` is always claimable; `Publishing` only once `lease` has
    /// passed since it was claimed.
    #[must_use]
    pub fn claimable(&self, now: DateTime<Utc>, lease: TimeDelta) -> bool {
        if self.status != InstanceStatus::Completed {
            return false;
        }
        match &self.emission {
            EmissionState::Pending { .. } => true,
            EmissionState::Publishing { claimed_at, .. } => *claimed_at + lease <= now,
            EmissionState::NotReady | EmissionState::Emitted { .. } => false,
        }
    }

    /// Take the emission claim for a publisher other than the completer.
    ///
    /// Only meaningful when the result is written back with a
    /// compare-and-set; the write is what makes the claim exclusive.
    pub fn claim_emission(&mut self, now: DateTime<Utc>) {
        let attempts = match &self.emission {
            EmissionState::Pending { attempts, .. } | EmissionState::Publishing { attempts, .. } => {
                *attempts
            }
            EmissionState::NotReady | EmissionState::Emitted { .. } => 0,
        };
        self.emission = EmissionState::Publishing {
            attempts,
            claimed_at: now,
            completer: false,
        };
    }

    /// Record `tag` and, if it was the last missing branch, complete the instance.
    ///
    /// The expected set is the one captured when the instance was created, so
    /// a tag added to the definition later is [`Transition::Undeclared`] here.
    /// The merge uses `definition`'s priority order, which is fixed per workflow
    /// type, so any writer produces the same merged payload.
    pub fn apply_arrival(
        &mut self,
        tag: BranchTag,
        payload: Payload,
        definition: &WorkflowDefinition,
        now: DateTime<Utc>,
    ) -> Transition {
        if !self.expected_branches.contains(&tag) {
            return Transition::Undeclared;
        }
        if self.arrived.contains_key(&tag) {
            return Transition::Duplicate;
        }
        if self.status == InstanceStatus::Completed {
            return Transition::AlreadyCompleted;
        }

        self.arrived.insert(tag, payload);

        if !self.all_arrived() {
            return Transition::Recorded;
        }

        let merged = merge_payloads(&self.arrived, definition.priority());
        self.status = InstanceStatus::Completed;
        self.completed_at = Some(now);
        self.merged_payload = Some(merged.clone());
        self.emission = EmissionState::Publishing {
            attempts: 0,
            claimed_at: now,
            completer: true,
        };
        Transition::Completed(merged)
    }

    /// Record a confirmed publish of the merged event.
    pub fn mark_emitted(&mut self, now: DateTime<Utc>) {
        self.emission = EmissionState::Emitted { at: now };
    }

    /// Record a failed publish attempt of the merged event.
    pub fn mark_emission_failed(&mut self, error: impl Into<String>) {
        let attempts = match &self.emission {
            EmissionState::Pending { attempts, .. } | EmissionState::Publishing { attempts, .. } => {
                attempts.saturating_add(1)
            }
            EmissionState::NotReady | EmissionState::Emitted { .. } => 1,
        };
        self.emission = EmissionState::Pending {
            attempts,
            last_error: Some(error.into()),
        };
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "order-processing",
            ["inventory.checked", "order.validated"],
            "order.ready",
        )
        .unwrap()
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn first_branch_is_recorded_and_instance_stays_open() {
        let def = definition();
        let mut instance = WorkflowInstance::open(&def, CorrelationId::new("trace-1"), now());

        let transition = instance.apply_arrival(
            BranchTag::new("inventory.checked"),
            payload(json!({"allAvailable": true})),
            &def,
            now(),
        );

        assert_eq!(transition, Transition::Recorded);
        assert_eq!(instance.status, InstanceStatus::Open);
        assert_eq!(instance.missing_branches(), vec![BranchTag::new("order.validated")]);
        assert_eq!(instance.emission, EmissionState::NotReady);
    }

    #[test]
    fn last_branch_completes_and_stores_merge() {
        let def = definition();
        let mut instance = WorkflowInstance::open(&def, CorrelationId::new("trace-1"), now());
        instance.apply_arrival(
            BranchTag::new("inventory.checked"),
            payload(json!({"allAvailable": true})),
            &def,
            now(),
        );

        let transition = instance.apply_arrival(
            BranchTag::new("order.validated"),
            payload(json!({"amount": 100, "currency": "USD"})),
            &def,
            now(),
        );

        let expected = payload(json!({
            "allAvailable": true,
            "amount": 100,
            "currency": "USD",
            "readyForNextStage": true,
        }));
        assert_eq!(transition, Transition::Completed(expected.clone()));
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.completed_at, Some(now()));
        assert_eq!(instance.merged_payload, Some(expected));
        assert!(instance.awaiting_emission());
        assert!(instance.held_by_completer());
    }

    #[test]
    fn duplicate_keeps_first_payload() {
        let def = definition();
        let mut instance = WorkflowInstance::open(&def, CorrelationId::new("trace-1"), now());
        instance.apply_arrival(
            BranchTag::new("inventory.checked"),
            payload(json!({"allAvailable": true})),
            &def,
            now(),
        );

        let transition = instance.apply_arrival(
            BranchTag::new("inventory.checked"),
            payload(json!({"allAvailable": false})),
            &def,
            now(),
        );

        assert_eq!(transition, Transition::Duplicate);
        assert!(!transition.is_mutation());
        assert_eq!(
            instance.arrived[&BranchTag::new("inventory.checked")]["allAvailable"],
            json!(true)
        );
    }

    #[test]
    fn undeclared_tag_leaves_instance_untouched() {
        let def = definition();
        let mut instance = WorkflowInstance::open(&def, CorrelationId::new("trace-1"), now());
        let before = instance.clone();

        let transition = instance.apply_arrival(
            BranchTag::new("unrelated.topic"),
            payload(json!({"x": 1})),
            &def,
            now(),
        );

        assert_eq!(transition, Transition::Undeclared);
        assert_eq!(instance, before);
    }

    #[test]
    fn emission_failures_accumulate_attempts() {
        let def = WorkflowDefinition::new("single", ["only"], "out").unwrap();
        let mut instance = WorkflowInstance::open(&def, CorrelationId::new("c"), now());
        instance.apply_arrival(BranchTag::new("only"), Payload::new(), &def, now());

        instance.mark_emission_failed("broker down");
        instance.mark_emission_failed("broker still down");

        assert_eq!(
            instance.emission,
            EmissionState::Pending {
                attempts: 2,
                last_error: Some("broker still down".to_string()),
            }
        );

        instance.mark_emitted(now());
        assert!(!instance.awaiting_emission());
    }

    #[test]
    fn completer_claim_is_leased_before_others_may_take_it() {
        let def = WorkflowDefinition::new("single", ["only"], "out").unwrap();
        let mut instance = WorkflowInstance::open(&def, CorrelationId::new("c"), now());
        let lease = TimeDelta::seconds(30);
        assert!(!instance.claimable(now(), lease));

        instance.apply_arrival(BranchTag::new("only"), Payload::new(), &def, now());

        assert!(!instance.claimable(now(), lease));
        assert!(!instance.claimable(now() + TimeDelta::seconds(29), lease));
        assert!(instance.claimable(now() + TimeDelta::seconds(30), lease));

        instance.claim_emission(now() + TimeDelta::seconds(30));
        assert!(!instance.held_by_completer());
        assert!(!instance.claimable(now() + TimeDelta::seconds(31), lease));
    }

    #[test]
    fn failed_publish_makes_emission_claimable_again() {
        let def = WorkflowDefinition::new("single", ["only"], "out").unwrap();
        let mut instance = WorkflowInstance::open(&def, CorrelationId::new("c"), now());
        instance.apply_arrival(BranchTag::new("only"), Payload::new(), &def, now());

        instance.mark_emission_failed("broker down");
        assert!(instance.claimable(now(), TimeDelta::seconds(30)));

        instance.claim_emission(now());
        assert_eq!(
            instance.emission,
            EmissionState::Publishing {
                attempts: 1,
                claimed_at: now(),
                completer: false,
            }
        );

        instance.mark_emitted(now());
        assert!(!instance.claimable(now() + TimeDelta::days(1), TimeDelta::seconds(30)));
    }

    #[test]
    fn status_storage_roundtrip() {
        for status in [InstanceStatus::Open, InstanceStatus::Completed] {
            assert_eq!(InstanceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(InstanceStatus::parse("abandoned"), None);
    }
}
