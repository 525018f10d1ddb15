//! Persistence layer for queued invocations
//!
//! This module provides:
//! - [`QueueBackend`], [`ResultStore`] and [`StatStore`] traits
//! - In-memory implementations for tests and single-process use
//! - PostgreSQL implementations for production
//! - [`Backends`], the bundle handed to tasks and workers

mod memory;
mod poller;
mod postgres;
mod store;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::task::DEFAULT_POLL_INTERVAL;

pub use memory::{InMemoryQueue, InMemoryResultStore, InMemoryStatStore};
pub use poller::{ClaimPoller, PollerConfig};
pub use postgres::{migrate, PostgresQueue, PostgresResultStore, PostgresStatStore};
pub use store::{
    result_key, ClaimedMessage, ExecutionStat, QueueBackend, QueueMessage, ResultRecord,
    ResultStore, StatStore, StoreError, RESULT_KEY_PREFIX,
};

pub(crate) use poller::duration_millis;

/// The three stores a producer or worker talks to
#[derive(Clone)]
pub struct Backends {
    pub queue: Arc<dyn QueueBackend>,
    pub results: Arc<dyn ResultStore>,
    pub stats: Arc<dyn StatStore>,
    /// Poll interval of result handles created through these backends
    pub result_poll_interval: Duration,
}

impl Backends {
    /// Bundle arbitrary store implementations
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        results: Arc<dyn ResultStore>,
        stats: Arc<dyn StatStore>,
    ) -> Self {
        Self {
            queue,
            results,
            stats,
            result_poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set how often submitted invocations' handles poll for results
    pub fn with_result_poll_interval(mut self, interval: Duration) -> Self {
        self.result_poll_interval = interval;
        self
    }

    /// Process-local stores, records expiring after `ttl`
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(
            Arc::new(InMemoryQueue::new()),
            Arc::new(InMemoryResultStore::new(ttl)),
            Arc::new(InMemoryStatStore::new()),
        )
    }

    /// PostgreSQL stores sharing one pool
    pub fn postgres(pool: PgPool, ttl: Duration, poller: PollerConfig) -> Self {
        Self::new(
            Arc::new(PostgresQueue::new(pool.clone(), poller)),
            Arc::new(PostgresResultStore::new(pool.clone(), ttl)),
            Arc::new(PostgresStatStore::new(pool)),
        )
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("result_ttl", &self.results.ttl())
            .field("result_poll_interval", &self.result_poll_interval)
            .finish_non_exhaustive()
    }
}
