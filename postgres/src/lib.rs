//! `PostgreSQL` instance store for the fan-in barrier.
//!
//! Implements [`InstanceStore`] on a single `fanin_instances` table keyed by
//! `(workflow_type, correlation_id)`. Every write is a compare-and-set on the
//! row's `version` column:
//!
//! - version 0: `INSERT ... ON CONFLICT DO NOTHING` (create if absent)
//! - otherwise: `UPDATE ... WHERE version = $expected`
//!
//! Zero affected rows means another writer committed first; the current
//! version is read back and reported as `ConcurrencyConflict`.
//!
//! # Example
//!
//! ```ignore
//! use fanin_postgres::PostgresInstanceStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresInstanceStore::new("postgres://localhost/fanin").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use fanin_core::correlation::{InstanceKey, Version};
use fanin_core::instance::{InstanceStatus, WorkflowInstance};
use fanin_core::instance_store::{InstanceStore, InstanceStoreError};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

const SELECT_COLUMNS: &str = "workflow_type, correlation_id, version, status, expected_branches, \
     arrived, merged_payload, emission, created_at, completed_at";

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, InstanceStoreError>> + Send + 'a>>;

/// PostgreSQL-backed [`InstanceStore`].
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct PostgresInstanceStore {
    pool: PgPool,
}

impl PostgresInstanceStore {
    /// Connect to `database_url` with a pool of up to 10 connections.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceStoreError::Unavailable`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, InstanceStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| InstanceStoreError::Unavailable(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Use an existing connection pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `fanin_instances` table and its indexes if missing.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceStoreError::Unavailable`] if migration fails.
    pub async fn migrate(&self) -> Result<(), InstanceStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| InstanceStoreError::Unavailable(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_version(&self, key: &InstanceKey) -> Result<Version, InstanceStoreError> {
        let version: Option<(i64,)> = sqlx::query_as(
            "SELECT version FROM fanin_instances WHERE workflow_type = $1 AND correlation_id = $2",
        )
        .bind(key.workflow_type.as_str())
        .bind(key.correlation_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        version.map_or(Ok(Version::INITIAL), |(v,)| from_db_version(v))
    }

    async fn write(&self, row: EncodedInstance) -> Result<Version, InstanceStoreError> {
        let start = Instant::now();
        let next = row.version.next();

        let result = if row.version.is_initial() {
            sqlx::query(
                r"
                INSERT INTO fanin_instances (
                    workflow_type, correlation_id, version, status, expected_branches,
                    arrived, merged_payload, emission, created_at, completed_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (workflow_type, correlation_id) DO NOTHING
                ",
            )
            .bind(row.key.workflow_type.as_str())
            .bind(row.key.correlation_id.as_str())
            .bind(to_db_version(next)?)
            .bind(row.status.as_str())
            .bind(&row.expected_branches)
            .bind(&row.arrived)
            .bind(&row.merged_payload)
            .bind(&row.emission)
            .bind(row.created_at)
            .bind(row.completed_at)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                r"
                UPDATE fanin_instances
                SET version = $3, status = $4, arrived = $5, merged_payload = $6,
                    emission = $7, completed_at = $8, updated_at = now()
                WHERE workflow_type = $1 AND correlation_id = $2 AND version = $9
                ",
            )
            .bind(row.key.workflow_type.as_str())
            .bind(row.key.correlation_id.as_str())
            .bind(to_db_version(next)?)
            .bind(row.status.as_str())
            .bind(&row.arrived)
            .bind(&row.merged_payload)
            .bind(&row.emission)
            .bind(row.completed_at)
            .bind(to_db_version(row.version)?)
            .execute(&self.pool)
            .await
        }
        .map_err(db_error)?;

        metrics::histogram!("fanin_store_write_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        if result.rows_affected() == 0 {
            let actual = self.current_version(&row.key).await?;
            tracing::debug!(
                key = %row.key,
                expected = %row.version,
                actual = %actual,
                "Instance write lost compare-and-set"
            );
            return Err(InstanceStoreError::ConcurrencyConflict {
                key: row.key,
                expected: row.version,
                actual,
            });
        }

        Ok(next)
    }

    async fn select(
        &self,
        filter: &str,
        bind_cutoff: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<WorkflowInstance>, InstanceStoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match bind_cutoff {
            Some(cutoff) => {
                let query = format!(
                    "SELECT {SELECT_COLUMNS} FROM fanin_instances WHERE {filter} LIMIT $2"
                );
                sqlx::query(&query)
                    .bind(cutoff)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let query = format!(
                    "SELECT {SELECT_COLUMNS} FROM fanin_instances WHERE {filter} LIMIT $1"
                );
                sqlx::query(&query).bind(limit).fetch_all(&self.pool).await
            }
        }
        .map_err(db_error)?;

        rows.iter().map(decode_row).collect()
    }
}

impl InstanceStore for PostgresInstanceStore {
    fn load(&self, key: &InstanceKey) -> StoreFuture<'_, Option<WorkflowInstance>> {
        let key = key.clone();
        Box::pin(async move {
            let query = format!(
                "SELECT {SELECT_COLUMNS} FROM fanin_instances \
                 WHERE workflow_type = $1 AND correlation_id = $2"
            );
            let row = sqlx::query(&query)
                .bind(key.workflow_type.as_str())
                .bind(key.correlation_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

            row.as_ref().map(decode_row).transpose()
        })
    }

    fn compare_and_swap(&self, instance: &WorkflowInstance) -> StoreFuture<'_, Version> {
        let encoded = EncodedInstance::encode(instance);
        Box::pin(async move { self.write(encoded?).await })
    }

    fn list_open_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<WorkflowInstance>> {
        Box::pin(async move {
            self.select(
                "status = 'open' AND created_at < $1 \
                 ORDER BY created_at, workflow_type, correlation_id",
                Some(cutoff),
                limit,
            )
            .await
        })
    }

    fn list_pending_emission(&self, limit: usize) -> StoreFuture<'_, Vec<WorkflowInstance>> {
        Box::pin(async move {
            self.select(
                "status = 'completed' AND emission->>'state' IN ('pending', 'publishing') \
                 ORDER BY completed_at, workflow_type, correlation_id",
                None,
                limit,
            )
            .await
        })
    }
}

/// An instance with its JSON columns already encoded.
struct EncodedInstance {
    key: InstanceKey,
    version: Version,
    status: InstanceStatus,
    expected_branches: Value,
    arrived: Value,
    merged_payload: Option<Value>,
    emission: Value,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl EncodedInstance {
    fn encode(instance: &WorkflowInstance) -> Result<Self, InstanceStoreError> {
        Ok(Self {
            key: instance.key.clone(),
            version: instance.version,
            status: instance.status,
            expected_branches: to_json(&instance.expected_branches)?,
            arrived: to_json(&instance.arrived)?,
            merged_payload: instance
                .merged_payload
                .as_ref()
                .map(|payload| Value::Object(payload.clone())),
            emission: to_json(&instance.emission)?,
            created_at: instance.created_at,
            completed_at: instance.completed_at,
        })
    }
}

fn decode_row(row: &PgRow) -> Result<WorkflowInstance, InstanceStoreError> {
    let workflow_type: String = row.try_get("workflow_type").map_err(db_error)?;
    let correlation_id: String = row.try_get("correlation_id").map_err(db_error)?;
    let version: i64 = row.try_get("version").map_err(db_error)?;
    let status: String = row.try_get("status").map_err(db_error)?;
    let merged_payload: Option<Value> = row.try_get("merged_payload").map_err(db_error)?;

    Ok(WorkflowInstance {
        key: InstanceKey::new(workflow_type.into(), correlation_id.into()),
        expected_branches: from_json(row.try_get("expected_branches").map_err(db_error)?)?,
        arrived: from_json(row.try_get("arrived").map_err(db_error)?)?,
        status: InstanceStatus::parse(&status).ok_or_else(|| {
            InstanceStoreError::Serialization(format!("Invalid instance status: {status}"))
        })?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        completed_at: row.try_get("completed_at").map_err(db_error)?,
        merged_payload: merged_payload.map(from_json).transpose()?,
        emission: from_json(row.try_get("emission").map_err(db_error)?)?,
        version: from_db_version(version)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, InstanceStoreError> {
    serde_json::to_value(value).map_err(|e| InstanceStoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, InstanceStoreError> {
    serde_json::from_value(value).map_err(|e| InstanceStoreError::Serialization(e.to_string()))
}

fn to_db_version(version: Version) -> Result<i64, InstanceStoreError> {
    i64::try_from(version.value())
        .map_err(|_| InstanceStoreError::Serialization(format!("Version {version} out of range")))
}

fn from_db_version(version: i64) -> Result<Version, InstanceStoreError> {
    u64::try_from(version)
        .map(Version::new)
        .map_err(|_| InstanceStoreError::Serialization(format!("Negative version {version}")))
}

fn db_error(error: sqlx::Error) -> InstanceStoreError {
    match error {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            InstanceStoreError::Serialization(error.to_string())
        }
        other => InstanceStoreError::Unavailable(other.to_string()),
    }
}
