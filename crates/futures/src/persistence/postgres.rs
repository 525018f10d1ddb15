//! PostgreSQL implementations of the queue, result and statistics stores
//!
//! - Exclusive claiming with `FOR UPDATE SKIP LOCKED`
//! - Result records with an `expires_at` column standing in for the TTL
//! - Statistics updated with relative deltas in single statements

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::{debug, error, instrument, trace};

use super::poller::{ClaimPoller, PollerConfig};
use super::store::*;
use crate::wait::Wait;

/// Apply the bundled schema migrations
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| {
            error!("Failed to run migrations: {}", e);
            StoreError::Database(e.to_string())
        })
}

/// PostgreSQL queue
///
/// A claim deletes the row it returns, inside one statement, so a message is
/// delivered at most once.
///
/// # Example
///
/// ```ignore
/// use tpq_futures::persistence::{PollerConfig, PostgresQueue};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/futures").await?;
/// let queue = PostgresQueue::new(pool, PollerConfig::default());
/// ```
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    poller: PollerConfig,
}

impl PostgresQueue {
    /// Create a queue backend on the given pool
    pub fn new(pool: PgPool, poller: PollerConfig) -> Self {
        Self { pool, poller }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn try_claim(&self, queue: &str) -> Result<Option<ClaimedMessage>, StoreError> {
        let row = sqlx::query(
            r#"
            DELETE FROM futures_queue
            WHERE id = (
                SELECT id
                FROM futures_queue
                WHERE queue_name = $1
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, data
            "#,
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim message: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let data: serde_json::Value = row.get("data");
        let message: QueueMessage = serde_json::from_value(data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(Some(ClaimedMessage {
            id: row.get("id"),
            message,
        }))
    }
}

#[async_trait]
impl QueueBackend for PostgresQueue {
    #[instrument(skip(self, message), fields(uid = %message.uid))]
    async fn enqueue(&self, queue: &str, message: QueueMessage) -> Result<i64, StoreError> {
        let data =
            serde_json::to_value(&message).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO futures_queue (queue_name, data)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(queue)
        .bind(&data)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue message: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(id, queue, "enqueued message");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn dequeue(
        &self,
        queue: &str,
        wait: Wait,
    ) -> Result<Option<ClaimedMessage>, StoreError> {
        let deadline = wait.deadline();
        let mut poller = ClaimPoller::new(self.poller.clone());

        loop {
            if let Some(claimed) = self.try_claim(queue).await? {
                debug!(id = claimed.id, uid = %claimed.message.uid, "claimed message");
                return Ok(Some(claimed));
            }

            let mut interval = poller.next_interval();
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    trace!(queue, "queue empty");
                    return Ok(None);
                }
                interval = interval.min(deadline - now);
            }
            tokio::time::sleep(interval).await;
        }
    }

    #[instrument(skip(self))]
    async fn clear(&self, queue: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM futures_queue WHERE queue_name = $1")
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to clear queue: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn count(&self, queue: &str) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM futures_queue WHERE queue_name = $1")
                .bind(queue)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(count as u64)
    }
}

/// PostgreSQL result store
///
/// Rows past `expires_at` are never returned; [`PostgresResultStore::purge_expired`]
/// deletes them.
#[derive(Clone)]
pub struct PostgresResultStore {
    pool: PgPool,
    ttl: Duration,
}

impl PostgresResultStore {
    /// Create a result store with the given record lifetime
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    /// Delete expired records, returning how many were removed
    #[instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM futures_results WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to purge results: {}", e);
                StoreError::Database(e.to_string())
            })?;

        let purged = result.rows_affected();
        if purged > 0 {
            debug!(purged, "purged expired results");
        }
        Ok(purged)
    }
}

#[async_trait]
impl ResultStore for PostgresResultStore {
    #[instrument(skip(self, record), fields(uid = %record.uid))]
    async fn set(&self, record: ResultRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO futures_results (key, uid, obj, ts, progress, expires_at)
            VALUES ($1, $2, $3, $4, $5, NOW() + make_interval(secs => $6))
            ON CONFLICT (key) DO UPDATE
            SET obj = EXCLUDED.obj,
                ts = EXCLUDED.ts,
                progress = EXCLUDED.progress,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(result_key(&record.uid))
        .bind(&record.uid)
        .bind(&record.obj)
        .bind(record.ts)
        .bind(record.progress)
        .bind(self.ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to store result: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, uid: &str) -> Result<Option<ResultRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT uid, obj, ts, progress
            FROM futures_results
            WHERE key = $1 AND expires_at > NOW()
            "#,
        )
        .bind(result_key(uid))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.map(|row| ResultRecord {
            uid: row.get("uid"),
            obj: row.get("obj"),
            ts: row.get("ts"),
            progress: row.get("progress"),
        }))
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// PostgreSQL statistics store
#[derive(Clone)]
pub struct PostgresStatStore {
    pool: PgPool,
}

impl PostgresStatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn stat_from_row(row: &sqlx::postgres::PgRow) -> ExecutionStat {
    ExecutionStat {
        name: row.get("name"),
        running: row.get("running"),
        total: row.get("total"),
        failed: row.get("failed"),
        first_seen: row.get("first_seen"),
        last_seen: row.get("last_seen"),
    }
}

#[async_trait]
impl StatStore for PostgresStatStore {
    #[instrument(skip(self))]
    async fn record_start(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO futures_stats (name, running, total, failed, first_seen, last_seen)
            VALUES ($1, 1, 1, 0, NOW(), NOW())
            ON CONFLICT (name) DO UPDATE
            SET running = futures_stats.running + 1,
                total = futures_stats.total + 1,
                last_seen = NOW()
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record execution start: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn record_end(&self, name: &str, failed: bool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE futures_stats
            SET running = GREATEST(running - 1, 0),
                failed = failed + $2
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(i64::from(failed))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record execution end: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_stat(&self, name: &str) -> Result<Option<ExecutionStat>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT name, running, total, failed, first_seen, last_seen
            FROM futures_stats
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.as_ref().map(stat_from_row))
    }

    #[instrument(skip(self))]
    async fn list_stats(&self) -> Result<Vec<ExecutionStat>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT name, running, total, failed, first_seen, last_seen
            FROM futures_stats
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(stat_from_row).collect())
    }
}
