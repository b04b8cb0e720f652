//! # Fan-In Testing
//!
//! Testing utilities for the fan-in barrier.
//!
//! This crate provides:
//! - In-memory implementations of the store and transport traits
//! - A fixed clock
//! - Fixtures for the order-processing workflow
//! - Proptest strategies for payloads and arrival orders
//!
//! ## Example
//!
//! ```ignore
//! use fanin_testing::{InMemoryEventBus, InMemoryInstanceStore, order_workflow, payload, test_clock};
//! use fanin_runtime::FanInBarrier;
//!
//! #[tokio::test]
//! async fn test_order_fan_in() {
//!     let barrier = FanInBarrier::new(
//!         order_workflow(),
//!         Arc::new(InMemoryInstanceStore::new()),
//!         Arc::new(InMemoryEventBus::new()),
//!         Arc::new(test_clock()),
//!     );
//!
//!     let outcome = barrier
//!         .record_arrival(&"trace-1".into(), &"inventory.checked".into(), payload(json!({"allAvailable": true})))
//!         .await
//!         .unwrap();
//!     assert!(matches!(outcome, BarrierOutcome::AwaitingMore { .. }));
//! }
//! ```

use chrono::{DateTime, Utc};
use fanin_core::environment::Clock;

mod bus_mocks;
mod instance_mocks;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::TimeDelta;
    use std::sync::{Arc, RwLock};

    pub use crate::bus_mocks::InMemoryEventBus;
    pub use crate::instance_mocks::{FlakyInstanceStore, InMemoryInstanceStore};

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same time until [`FixedClock::advance`] moves it. Clones
    /// share the time, so a test can advance the clock a barrier holds.
    ///
    /// # Example
    ///
    /// ```
    /// use fanin_testing::mocks::FixedClock;
    /// use fanin_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward by `by`.
        #[allow(clippy::unwrap_used)] // Poisoned only if a test already panicked
        pub fn advance(&self, by: TimeDelta) {
            *self.time.write().unwrap() += by;
        }
    }

    impl Clock for FixedClock {
        #[allow(clippy::unwrap_used)] // Poisoned only if a test already panicked
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded timestamp fails to parse, which never happens.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Fixtures for the order-processing workflow
pub mod helpers {
    use fanin_core::event::BranchCompletion;
    use fanin_core::{Payload, WorkflowDefinition};
    use serde_json::Value;

    /// The order workflow: inventory and validation branches, emitting `order.ready`.
    ///
    /// Inventory fields win collisions.
    ///
    /// # Panics
    ///
    /// Never; the definition is a valid constant.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn order_workflow() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "order-processing",
            ["inventory.checked", "order.validated"],
            "order.ready",
        )
        .expect("order workflow definition is valid")
    }

    /// Convert a `json!({...})` literal into a payload.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a JSON object.
    #[must_use]
    #[allow(clippy::panic)]
    pub fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            other => panic!("payload fixture must be a JSON object, got {other}"),
        }
    }

    /// A branch completion for `correlation_id` with a JSON object payload.
    #[must_use]
    pub fn branch(correlation_id: &str, branch_tag: &str, value: Value) -> BranchCompletion {
        BranchCompletion::new(correlation_id, branch_tag, payload(value))
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use fanin_core::Payload;
    use proptest::prelude::*;
    use serde_json::Value;

    /// Scalar JSON values.
    pub fn json_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,8}".prop_map(Value::from),
        ]
    }

    /// Payloads drawn from a small key space so that collisions are common.
    pub fn payload_strategy() -> impl Strategy<Value = Payload> {
        prop::collection::btree_map("[a-e]", json_scalar(), 0..5)
            .prop_map(|fields| fields.into_iter().collect())
    }

    /// Every permutation of `items` is reachable.
    pub fn arrival_order<T: Clone + std::fmt::Debug>(items: Vec<T>) -> impl Strategy<Value = Vec<T>> {
        Just(items).prop_shuffle()
    }
}

// Re-export commonly used items
pub use helpers::{branch, order_workflow, payload};
pub use mocks::{FixedClock, FlakyInstanceStore, InMemoryEventBus, InMemoryInstanceStore, test_clock};
