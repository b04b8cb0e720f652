//! # Fan-In Core
//!
//! Core types and traits for a durable N-of-M fan-in barrier.
//!
//! A workflow instance is split into independent branches that run
//! concurrently and each report completion once, tagged with the instance's
//! correlation id. The barrier waits until every expected branch has reported,
//! merges their payloads exactly once, and forwards a single combined event.
//!
//! ## Core Concepts
//!
//! - **Workflow definition**: expected branches, merge priority, output topic
//! - **Workflow instance**: durable per-correlation-id record of arrivals
//! - **Instance store**: versioned compare-and-set storage of instances
//! - **Event bus**: at-least-once transport for branch and merged events
//!
//! ## Guarantees
//!
//! - First payload per branch wins; redeliveries are no-ops
//! - The merged payload is independent of arrival order
//! - Exactly one writer commits the `Open → Completed` transition
//!
//! The barrier itself lives in `fanin-runtime`; this crate holds the pure
//! state machine and the seams to external collaborators.

pub use chrono::{DateTime, Utc};

pub mod correlation;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod instance;
pub mod instance_store;
pub mod payload;
pub mod workflow;

pub use correlation::{BranchTag, CorrelationId, InstanceKey, Version, WorkflowType};
pub use error::BarrierError;
pub use instance::{EmissionState, InstanceStatus, Transition, WorkflowInstance};
pub use payload::{Payload, READY_MARKER};
pub use workflow::WorkflowDefinition;

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time for testability
    ///
    /// The barrier stamps `created_at`, `completed_at`, and emission times
    /// through this trait so tests can pin them.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
