//! Per-process resource hooks
//!
//! Connections must never be shared between the supervisor and its worker
//! processes. The supervisor drops its own before starting workers, and
//! each worker process opens fresh ones before its threads start.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::persistence::{self, Backends, PollerConfig};

/// Setup and teardown around worker processes
#[async_trait]
pub trait ProcessHooks: Send + Sync + 'static {
    /// Supervisor side, before each worker process is started
    async fn before_spawn(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Worker side, before any worker thread starts
    async fn connect(&self) -> anyhow::Result<Backends>;

    /// Worker side, after every worker thread has been joined
    async fn disconnect(&self, _backends: Backends) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hands out an existing set of backends
///
/// For in-process workers, where nothing crosses a process boundary.
#[derive(Debug, Clone)]
pub struct SharedBackends(pub Backends);

#[async_trait]
impl ProcessHooks for SharedBackends {
    async fn connect(&self) -> anyhow::Result<Backends> {
        Ok(self.0.clone())
    }
}

/// Opens a PostgreSQL pool per worker process
pub struct PostgresConnector {
    database_url: String,
    max_connections: u32,
    result_ttl: Duration,
    poller: PollerConfig,
    run_migrations: bool,
    pool: Mutex<Option<PgPool>>,
}

impl PostgresConnector {
    pub fn new(database_url: impl Into<String>, result_ttl: Duration) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 5,
            result_ttl,
            poller: PollerConfig::default(),
            run_migrations: false,
            pool: Mutex::new(None),
        }
    }

    /// Set the pool size of each worker process
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Set the empty-queue polling configuration
    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    /// Apply schema migrations on connect
    pub fn with_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    async fn close_pool(&self) {
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.close().await;
            debug!("closed database pool");
        }
    }
}

#[async_trait]
impl ProcessHooks for PostgresConnector {
    async fn before_spawn(&self) -> anyhow::Result<()> {
        self.close_pool().await;
        Ok(())
    }

    async fn connect(&self) -> anyhow::Result<Backends> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.database_url)
            .await
            .context("failed to connect to the database")?;

        if self.run_migrations {
            persistence::migrate(&pool)
                .await
                .context("failed to apply migrations")?;
            info!("database migrations applied");
        }

        *self.pool.lock() = Some(pool.clone());
        Ok(Backends::postgres(pool, self.result_ttl, self.poller.clone()))
    }

    async fn disconnect(&self, backends: Backends) -> anyhow::Result<()> {
        drop(backends);
        self.close_pool().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::QueueMessage;
    use crate::wait::Wait;

    #[tokio::test]
    async fn test_shared_backends_share_state() {
        let backends = Backends::in_memory(Duration::from_secs(60));
        let hooks = SharedBackends(backends.clone());

        hooks.before_spawn().await.unwrap();
        let connected = hooks.connect().await.unwrap();
        connected
            .queue
            .enqueue(
                "q",
                QueueMessage {
                    uid: "1".into(),
                    name: "t".into(),
                    args: "[]".into(),
                    kwargs: "{}".into(),
                },
            )
            .await
            .unwrap();

        assert!(backends.queue.dequeue("q", Wait::IMMEDIATE).await.unwrap().is_some());
        hooks.disconnect(connected).await.unwrap();
    }

    #[tokio::test]
    async fn test_connector_config() {
        let connector = PostgresConnector::new("postgres://localhost/none", Duration::from_secs(5))
            .with_max_connections(0)
            .with_migrations(true);
        assert_eq!(connector.max_connections, 1);
        assert!(connector.run_migrations);

        // No pool opened yet; closing is a no-op
        connector.before_spawn().await.unwrap();
    }
}
