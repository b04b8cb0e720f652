//! Read-only operator view of instances that have been open too long.
//!
//! The barrier has no timeout: an instance whose last branch never arrives
//! stays open forever. This module only reports such instances; what to do
//! with them (alert, compensate, ignore) is an operator decision.

use chrono::{DateTime, TimeDelta, Utc};
use fanin_core::instance_store::{InstanceStore, InstanceStoreError};
use fanin_core::{BranchTag, InstanceKey};

/// An open instance older than the requested age.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaleInstance {
    /// Instance key.
    pub key: InstanceKey,
    /// When the first branch arrived.
    pub created_at: DateTime<Utc>,
    /// How long the instance has been open.
    pub age: TimeDelta,
    /// Branches recorded so far.
    pub arrived: Vec<BranchTag>,
    /// Branches never received.
    pub missing: Vec<BranchTag>,
}

/// Open instances created more than `max_age` before `now`, oldest first.
///
/// Never modifies the store.
///
/// # Errors
///
/// Returns the store error if the query fails.
pub async fn stale_instances(
    store: &dyn InstanceStore,
    now: DateTime<Utc>,
    max_age: TimeDelta,
    limit: usize,
) -> Result<Vec<StaleInstance>, InstanceStoreError> {
    let cutoff = now
        .checked_sub_signed(max_age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let open = store.list_open_before(cutoff, limit).await?;

    Ok(open
        .into_iter()
        .map(|instance| StaleInstance {
            age: now - instance.created_at,
            created_at: instance.created_at,
            arrived: instance.arrived.keys().cloned().collect(),
            missing: instance.missing_branches(),
            key: instance.key,
        })
        .collect())
}
