//! # Fan-In Runtime
//!
//! Runtime for the durable fan-in barrier.
//!
//! ## Core Components
//!
//! - **`FanInBarrier`**: records branch arrivals with a compare-and-set loop
//!   and emits the merged event exactly once per instance
//! - **`Coordinator`**: subscribes to branch topics and routes events to barriers
//! - **`EmissionSweeper`**: re-publishes merged events whose publish failed
//! - **`stale_instances`**: read-only report of instances that never completed
//!
//! ## Example
//!
//! ```ignore
//! use fanin_runtime::{FanInBarrier, BarrierOutcome};
//! use fanin_core::environment::SystemClock;
//!
//! let barrier = FanInBarrier::new(definition, store, bus, Arc::new(SystemClock));
//!
//! match barrier.record_arrival(&correlation_id, &branch_tag, payload).await? {
//!     BarrierOutcome::ReadyToEmit(merged) => barrier.emit_merged(&correlation_id, merged).await?,
//!     other => tracing::debug!(?other, "Nothing to emit"),
//! }
//! ```

/// Fan-in barrier for one workflow type
pub mod barrier;

/// TOML configuration
pub mod config;

/// Subscription loop routing branch events to barriers
pub mod coordinator;

/// Operator inspection of stuck instances
pub mod inspect;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Re-publication of pending merged events
pub mod sweeper;

pub use barrier::{BarrierOutcome, EmissionRetry, FanInBarrier};
pub use config::{ConfigError, CoordinatorSettings, FanInConfig, SweeperSettings};
pub use coordinator::{Coordinator, CoordinatorError};
pub use inspect::{StaleInstance, stale_instances};
pub use retry::RetryPolicy;
pub use sweeper::{EmissionSweeper, SweepReport};
