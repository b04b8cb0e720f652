//! In-memory instance store testing utilities
//!
//! - [`InMemoryInstanceStore`]: HashMap-based versioned storage with the same
//!   compare-and-set semantics as the Postgres store
//! - [`FlakyInstanceStore`]: wrapper that fails a chosen number of calls with
//!   `Unavailable`, for exercising retry paths

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use chrono::{DateTime, Utc};
use fanin_core::correlation::{InstanceKey, Version};
use fanin_core::instance::WorkflowInstance;
use fanin_core::instance_store::{InstanceStore, InstanceStoreError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, InstanceStoreError>> + Send + 'a>>;

/// In-memory instance store for fast, deterministic testing.
///
/// Clones share the same records.
///
/// # Example
///
/// ```
/// use fanin_testing::{InMemoryInstanceStore, order_workflow, test_clock};
/// use fanin_core::environment::Clock;
/// use fanin_core::instance_store::InstanceStore;
/// use fanin_core::{CorrelationId, Version, WorkflowInstance};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryInstanceStore::new();
/// let instance = WorkflowInstance::open(&order_workflow(), CorrelationId::new("c-1"), test_clock().now());
///
/// assert_eq!(store.compare_and_swap(&instance).await.unwrap(), Version::new(1));
/// // A second create of the same key loses.
/// assert!(store.compare_and_swap(&instance).await.unwrap_err().is_conflict());
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryInstanceStore {
    records: Arc<RwLock<HashMap<InstanceKey, WorkflowInstance>>>,
    conflicts: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl InMemoryInstanceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored record for `key`, read synchronously.
    #[must_use]
    pub fn get(&self, key: &InstanceKey) -> Option<WorkflowInstance> {
        self.records.read().unwrap().get(key).cloned()
    }

    /// Number of stored instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether the store holds no instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Compare-and-set calls rejected with a conflict so far.
    #[must_use]
    pub fn conflict_count(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }

    /// Successful writes so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Remove every instance (for test isolation).
    pub fn clear(&self) {
        self.records.write().unwrap().clear();
    }

    fn swap(&self, instance: &WorkflowInstance) -> Result<Version, InstanceStoreError> {
        let mut records = self.records.write().unwrap();
        let actual = records
            .get(&instance.key)
            .map_or(Version::INITIAL, |stored| stored.version);

        if actual != instance.version {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(InstanceStoreError::ConcurrencyConflict {
                key: instance.key.clone(),
                expected: instance.version,
                actual,
            });
        }

        let next = instance.version.next();
        let mut stored = instance.clone();
        stored.version = next;
        records.insert(stored.key.clone(), stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }

    fn select<F, K>(&self, filter: F, sort_key: K, limit: usize) -> Vec<WorkflowInstance>
    where
        F: Fn(&WorkflowInstance) -> bool,
        K: Fn(&WorkflowInstance) -> DateTime<Utc>,
    {
        let records = self.records.read().unwrap();
        let mut selected: Vec<WorkflowInstance> =
            records.values().filter(|i| filter(i)).cloned().collect();
        selected.sort_by_key(|i| (sort_key(i), i.key.clone()));
        selected.truncate(limit);
        selected
    }
}

impl InstanceStore for InMemoryInstanceStore {
    fn load(&self, key: &InstanceKey) -> StoreFuture<'_, Option<WorkflowInstance>> {
        let result = self.get(key);
        Box::pin(async move { Ok(result) })
    }

    fn compare_and_swap(&self, instance: &WorkflowInstance) -> StoreFuture<'_, Version> {
        let instance = instance.clone();
        Box::pin(async move {
            // Let concurrent writers interleave between load and write.
            tokio::task::yield_now().await;
            self.swap(&instance)
        })
    }

    fn list_open_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<WorkflowInstance>> {
        let result = self.select(
            |i| i.status == fanin_core::InstanceStatus::Open && i.created_at < cutoff,
            |i| i.created_at,
            limit,
        );
        Box::pin(async move { Ok(result) })
    }

    fn list_pending_emission(&self, limit: usize) -> StoreFuture<'_, Vec<WorkflowInstance>> {
        let result = self.select(
            WorkflowInstance::awaiting_emission,
            |i| i.completed_at.unwrap_or(i.created_at),
            limit,
        );
        Box::pin(async move { Ok(result) })
    }
}

/// Instance store that fails the next `n` calls with `Unavailable`.
///
/// # Example
///
/// ```
/// use fanin_testing::{FlakyInstanceStore, InMemoryInstanceStore};
/// use fanin_core::instance_store::InstanceStore;
/// use fanin_core::{CorrelationId, InstanceKey, WorkflowType};
///
/// # tokio_test::block_on(async {
/// let store = FlakyInstanceStore::new(InMemoryInstanceStore::new());
/// store.fail_next(1);
///
/// let key = InstanceKey::new(WorkflowType::new("wf"), CorrelationId::new("c"));
/// assert!(store.load(&key).await.is_err());
/// assert!(store.load(&key).await.is_ok());
/// # });
/// ```
#[derive(Clone, Debug)]
pub struct FlakyInstanceStore {
    inner: InMemoryInstanceStore,
    remaining_failures: Arc<AtomicUsize>,
}

impl FlakyInstanceStore {
    /// Wrap `inner`; no failures are scheduled initially.
    #[must_use]
    pub fn new(inner: InMemoryInstanceStore) -> Self {
        Self {
            inner,
            remaining_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the next `n` calls.
    pub fn fail_next(&self, n: usize) {
        self.remaining_failures.store(n, Ordering::SeqCst);
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &InMemoryInstanceStore {
        &self.inner
    }

    fn take_failure(&self) -> Option<InstanceStoreError> {
        self.remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| InstanceStoreError::Unavailable("injected failure".to_string()))
    }
}

impl InstanceStore for FlakyInstanceStore {
    fn load(&self, key: &InstanceKey) -> StoreFuture<'_, Option<WorkflowInstance>> {
        if let Some(err) = self.take_failure() {
            return Box::pin(async move { Err(err) });
        }
        self.inner.load(key)
    }

    fn compare_and_swap(&self, instance: &WorkflowInstance) -> StoreFuture<'_, Version> {
        if let Some(err) = self.take_failure() {
            return Box::pin(async move { Err(err) });
        }
        self.inner.compare_and_swap(instance)
    }

    fn list_open_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<WorkflowInstance>> {
        if let Some(err) = self.take_failure() {
            return Box::pin(async move { Err(err) });
        }
        self.inner.list_open_before(cutoff, limit)
    }

    fn list_pending_emission(&self, limit: usize) -> StoreFuture<'_, Vec<WorkflowInstance>> {
        if let Some(err) = self.take_failure() {
            return Box::pin(async move { Err(err) });
        }
        self.inner.list_pending_emission(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{order_workflow, test_clock};
    use fanin_core::environment::Clock;
    use fanin_core::{BranchTag, CorrelationId, Payload};

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = InMemoryInstanceStore::new();
        let def = order_workflow();
        let opened = WorkflowInstance::open(&def, CorrelationId::new("c-1"), test_clock().now());
        store.compare_and_swap(&opened).await.unwrap();

        let mut first = store.load(&opened.key).await.unwrap().unwrap();
        let mut second = first.clone();
        first.apply_arrival(BranchTag::new("order.validated"), Payload::new(), &def, test_clock().now());
        second.apply_arrival(BranchTag::new("inventory.checked"), Payload::new(), &def, test_clock().now());

        assert_eq!(store.compare_and_swap(&first).await.unwrap(), Version::new(2));
        let err = store.compare_and_swap(&second).await.unwrap_err();

        assert_eq!(
            err,
            InstanceStoreError::ConcurrencyConflict {
                key: opened.key.clone(),
                expected: Version::new(1),
                actual: Version::new(2),
            }
        );
        assert_eq!(store.conflict_count(), 1);
        assert_eq!(store.get(&opened.key).unwrap().arrived.len(), 1);
    }

    #[tokio::test]
    async fn pending_emission_lists_only_completed_unemitted() {
        let store = InMemoryInstanceStore::new();
        let def = fanin_core::WorkflowDefinition::new("single", ["only"], "out").unwrap();
        let now = test_clock().now();

        let mut done = WorkflowInstance::open(&def, CorrelationId::new("done"), now);
        done.apply_arrival(BranchTag::new("only"), Payload::new(), &def, now);
        store.compare_and_swap(&done).await.unwrap();

        let open = WorkflowInstance::open(&def, CorrelationId::new("open"), now);
        store.compare_and_swap(&open).await.unwrap();

        let pending = store.list_pending_emission(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].correlation_id().as_str(), "done");
    }

    #[tokio::test]
    async fn flaky_store_recovers_after_scheduled_failures() {
        let store = FlakyInstanceStore::new(InMemoryInstanceStore::new());
        let key = InstanceKey::new("wf".into(), "c".into());
        store.fail_next(2);

        assert!(store.load(&key).await.is_err());
        assert!(store.load(&key).await.is_err());
        assert!(store.load(&key).await.unwrap().is_none());
    }
}
