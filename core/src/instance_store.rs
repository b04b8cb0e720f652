//! Durable instance store abstraction.
//!
//! The store owns exactly one mutable resource per [`InstanceKey`]: the
//! instance record. Its single write entry point is
//! [`InstanceStore::compare_and_swap`], which commits a new record only if the
//! stored version still equals the version the writer loaded. Every
//! read-check-insert-transition sequence the barrier performs therefore
//! commits atomically or not at all.
//!
//! # Implementations
//!
//! - `PostgresInstanceStore` (in `fanin-postgres`): production, versioned rows
//! - `InMemoryInstanceStore` (in `fanin-testing`): fast, deterministic tests
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` so the barrier can hold an
//! `Arc<dyn InstanceStore>`.

use crate::correlation::{InstanceKey, Version};
use crate::instance::WorkflowInstance;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during instance store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstanceStoreError {
    /// The record changed between load and write.
    ///
    /// The writer must reload and re-apply its transition.
    #[error("Concurrency conflict on {key}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The contended instance.
        key: InstanceKey,
        /// Version the writer loaded.
        expected: Version,
        /// Version currently stored.
        actual: Version,
    },

    /// The store could not be reached or the operation failed.
    #[error("Instance store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl InstanceStoreError {
    /// Whether reloading and re-applying may succeed.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Durable keyed storage for [`WorkflowInstance`] records.
///
/// Implementations must be durable across process restarts and must make
/// `compare_and_swap` atomic with respect to every other writer of the same
/// key. Distinct keys must not contend.
///
/// # Example
///
/// ```no_run
/// use fanin_core::instance_store::{InstanceStore, InstanceStoreError};
/// use fanin_core::correlation::{CorrelationId, InstanceKey, WorkflowType};
///
/// async fn inspect<S: InstanceStore>(store: &S) -> Result<(), InstanceStoreError> {
///     let key = InstanceKey::new(WorkflowType::new("order-processing"), CorrelationId::new("trace-1"));
///     if let Some(instance) = store.load(&key).await? {
///         println!("{} arrived: {:?}", key, instance.arrived.keys());
///     }
///     Ok(())
/// }
/// ```
pub trait InstanceStore: Send + Sync {
    /// Load the record for `key`.
    ///
    /// Returns `None` for an instance that was never written or has expired.
    /// The returned instance carries the stored [`Version`].
    ///
    /// # Errors
    ///
    /// - `Unavailable`: the store could not be queried
    /// - `Serialization`: the stored record is corrupt
    fn load(
        &self,
        key: &InstanceKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WorkflowInstance>, InstanceStoreError>> + Send + '_>>;

    /// Write `instance` if the stored version equals `instance.version`.
    ///
    /// An instance carrying [`Version::INITIAL`] is created only if no record
    /// exists for its key. On success returns the new stored version
    /// (`instance.version.next()`).
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: another writer committed first; nothing was written
    /// - `Unavailable`: the write could not be completed; nothing was written
    /// - `Serialization`: the instance could not be encoded
    fn compare_and_swap(
        &self,
        instance: &WorkflowInstance,
    ) -> Pin<Box<dyn Future<Output = Result<Version, InstanceStoreError>> + Send + '_>>;

    /// Open instances created before `cutoff`, oldest first.
    ///
    /// Read-only operator inspection; the barrier itself never calls it.
    ///
    /// # Errors
    ///
    /// - `Unavailable`: the store could not be queried
    fn list_open_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WorkflowInstance>, InstanceStoreError>> + Send + '_>>;

    /// Completed instances whose merged event has not been published, oldest first.
    ///
    /// # Errors
    ///
    /// - `Unavailable`: the store could not be queried
    fn list_pending_emission(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WorkflowInstance>, InstanceStoreError>> + Send + '_>>;
}
