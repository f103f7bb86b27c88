//! # PostgreSQL Shared Store
//!
//! Multi-process implementation of [`SharedStore`] on top of `sqlx`.
//!
//! Each primitive is a single statement (or a single transaction for slot
//! acquisition), so atomicity comes from the database rather than from any
//! in-process lock:
//!
//! ```sql
//! -- atomic increment-and-get
//! INSERT INTO verity_counters (key, value) VALUES ($1, $2)
//! ON CONFLICT (key) DO UPDATE SET value = verity_counters.value + EXCLUDED.value
//! RETURNING value
//!
//! -- set-if-absent
//! INSERT INTO verity_counters (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING
//! ```
//!
//! Slot acquisition serializes per permit name with `pg_advisory_xact_lock`.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use super::{SharedStore, StoreError, StoreResult, VersionedDocument};

/// Postgres-backed shared store
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using a database URL with the given pool size
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::backend("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations (idempotent)
    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::backend("migrate", e))?;
        debug!("Shared store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_version(raw: i64) -> StoreResult<u64> {
    u64::try_from(raw).map_err(|_| StoreError::InvalidArgument(format!("negative version {raw}")))
}

fn to_db_version(version: u64) -> StoreResult<i64> {
    i64::try_from(version)
        .map_err(|_| StoreError::InvalidArgument(format!("version {version} out of range")))
}

#[async_trait]
impl SharedStore for PostgresStore {
    async fn get_document(&self, key: &str) -> StoreResult<Option<VersionedDocument>> {
        let row = sqlx::query("SELECT key, value, version FROM verity_documents WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::backend("get_document", e))?;

        row.map(|row| {
            Ok(VersionedDocument {
                key: row.try_get("key")?,
                value: row.try_get("value")?,
                version: to_version(row.try_get("version")?)?,
            })
        })
        .transpose()
    }

    async fn put_document(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: serde_json::Value,
    ) -> StoreResult<Option<u64>> {
        match expected_version {
            None => {
                let result = sqlx::query(
                    "INSERT INTO verity_documents (key, value, version) VALUES ($1, $2, 1) \
                     ON CONFLICT (key) DO NOTHING",
                )
                .bind(key)
                .bind(sqlx::types::Json(&value))
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::backend("put_document", e))?;

                Ok((result.rows_affected() == 1).then_some(1))
            }
            Some(expected) => {
                let result = sqlx::query(
                    "UPDATE verity_documents SET value = $2, version = version + 1, updated_at = now() \
                     WHERE key = $1 AND version = $3",
                )
                .bind(key)
                .bind(sqlx::types::Json(&value))
                .bind(to_db_version(expected)?)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::backend("put_document", e))?;

                Ok((result.rows_affected() == 1).then_some(expected + 1))
            }
        }
    }

    async fn list_documents(&self, prefix: &str) -> StoreResult<Vec<VersionedDocument>> {
        let rows = sqlx::query(
            "SELECT key, value, version FROM verity_documents \
             WHERE left(key, length($1)) = $1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::backend("list_documents", e))?;

        rows.into_iter()
            .map(|row| {
                Ok(VersionedDocument {
                    key: row.try_get("key")?,
                    value: row.try_get("value")?,
                    version: to_version(row.try_get("version")?)?,
                })
            })
            .collect()
    }

    async fn incr_counter(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let value: i64 = sqlx::query_scalar(
            "INSERT INTO verity_counters (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = verity_counters.value + EXCLUDED.value \
             RETURNING value",
        )
        .bind(key)
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::backend("incr_counter", e))?;
        Ok(value)
    }

    async fn get_counter(&self, key: &str) -> StoreResult<Option<i64>> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT value FROM verity_counters WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::backend("get_counter", e))?;
        Ok(value)
    }

    async fn set_counter_if_absent(&self, key: &str, value: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO verity_counters (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::backend("set_counter_if_absent", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_acquire_slot(
        &self,
        name: &str,
        holder: Uuid,
        capacity: u32,
        expiry: Duration,
    ) -> StoreResult<bool> {
        let expiry_secs = expiry.as_secs_f64();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::backend("try_acquire_slot", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM verity_slots WHERE name = $1 AND expires_at <= now()")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        let refreshed = sqlx::query(
            "UPDATE verity_slots SET expires_at = now() + make_interval(secs => $3) \
             WHERE name = $1 AND holder = $2",
        )
        .bind(name)
        .bind(holder)
        .bind(expiry_secs)
        .execute(&mut *tx)
        .await?;

        if refreshed.rows_affected() == 1 {
            tx.commit().await?;
            return Ok(true);
        }

        let held: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM verity_slots WHERE name = $1")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;

        if held >= i64::from(capacity) {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO verity_slots (name, holder, expires_at) \
             VALUES ($1, $2, now() + make_interval(secs => $3))",
        )
        .bind(name)
        .bind(holder)
        .bind(expiry_secs)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn release_slot(&self, name: &str, holder: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM verity_slots WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("release_slot", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn slot_holders(&self, name: &str) -> StoreResult<u32> {
        let held: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM verity_slots WHERE name = $1 AND expires_at > now()",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::backend("slot_holders", e))?;
        Ok(u32::try_from(held).unwrap_or(u32::MAX))
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::backend("delete_prefix", e))?;
        let mut removed = 0;
        for table in ["verity_documents", "verity_counters"] {
            let sql = format!("DELETE FROM {table} WHERE left(key, length($1)) = $1");
            removed += sqlx::query(&sql)
                .bind(prefix)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        removed += sqlx::query("DELETE FROM verity_slots WHERE left(name, length($1)) = $1")
            .bind(prefix)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed)
    }
}
