//! Errors signalled by the fan-in barrier.

use crate::correlation::{BranchTag, CorrelationId, WorkflowType};
use crate::event::EventError;
use crate::event_bus::EventBusError;
use crate::instance_store::InstanceStoreError;
use thiserror::Error;

/// Failure of a barrier operation.
///
/// Duplicate deliveries are not errors; they are reported as outcomes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BarrierError {
    /// A branch reported under a tag its workflow type does not declare.
    ///
    /// Configuration error: the instance record is left untouched.
    #[error("Branch '{branch_tag}' is not declared by workflow '{workflow_type}'")]
    UnknownBranchTag {
        /// Workflow the arrival was routed to (or `*` when no workflow declares the tag).
        workflow_type: WorkflowType,
        /// The undeclared tag.
        branch_tag: BranchTag,
    },

    /// The correlation id was empty.
    #[error("Correlation id must not be empty")]
    InvalidCorrelationId,

    /// The atomic read-modify-write could not be completed.
    ///
    /// Nothing was written; the caller should let the transport redeliver.
    #[error("Instance store unavailable: {0}")]
    StoreUnavailable(#[source] InstanceStoreError),

    /// Publishing the merged event failed; the instance records a pending emission.
    #[error("Emission of merged event for '{correlation_id}' failed: {source}")]
    EmissionFailed {
        /// Completed instance whose event was not published.
        correlation_id: CorrelationId,
        /// Transport failure.
        #[source]
        source: EventBusError,
    },

    /// No record exists for an instance an operation expected to find.
    #[error("No instance '{correlation_id}' for workflow '{workflow_type}'")]
    InstanceNotFound {
        /// Workflow type looked up.
        workflow_type: WorkflowType,
        /// Correlation id looked up.
        correlation_id: CorrelationId,
    },

    /// A delivered event could not be decoded.
    #[error("Malformed event: {0}")]
    MalformedEvent(#[from] EventError),
}

impl BarrierError {
    /// Whether redelivering the same input may succeed.
    ///
    /// Emission failures are not transient in this sense: a redelivered branch
    /// event is a duplicate, and the pending emission is retried from the
    /// stored merged payload instead.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnknownBranchTag { .. } => "unknown_branch_tag",
            Self::InvalidCorrelationId => "invalid_correlation_id",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::EmissionFailed { .. } => "emission_failed",
            Self::InstanceNotFound { .. } => "instance_not_found",
            Self::MalformedEvent(_) => "malformed_event",
        }
    }
}

impl From<InstanceStoreError> for BarrierError {
    fn from(error: InstanceStoreError) -> Self {
        Self::StoreUnavailable(error)
    }
}
