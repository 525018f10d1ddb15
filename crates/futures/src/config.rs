//! Environment configuration

use std::time::Duration;

use sqlx::PgPool;

use crate::persistence::{Backends, PollerConfig};
use crate::task::{DEFAULT_POLL_INTERVAL, DEFAULT_QUEUE};

/// Default lifetime of result records
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(3600);

/// Deployment-wide settings shared by producers and workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuturesConfig {
    /// Queue tasks target unless they name their own
    pub queue_name: String,
    /// Lifetime of result records
    pub result_ttl: Duration,
    /// How often result handles poll the store
    pub result_poll_interval: Duration,
    /// PostgreSQL connection string
    pub database_url: Option<String>,
}

impl Default for FuturesConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE.to_string(),
            result_ttl: DEFAULT_RESULT_TTL,
            result_poll_interval: DEFAULT_POLL_INTERVAL,
            database_url: None,
        }
    }
}

impl FuturesConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `FUTURES_QUEUE_NAME`: Default queue (default: "futures")
    /// - `FUTURES_CACHE_TTL`: Result lifetime in seconds (default: 3600)
    /// - `FUTURES_RESULT_POLL_MS`: Result poll interval in milliseconds (default: 1000)
    /// - `DATABASE_URL`: PostgreSQL connection string
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Process-local backends honouring the result ttl and poll interval
    pub fn in_memory_backends(&self) -> Backends {
        Backends::in_memory(self.result_ttl).with_result_poll_interval(self.result_poll_interval)
    }

    /// PostgreSQL backends honouring the result ttl and poll interval
    pub fn postgres_backends(&self, pool: PgPool, poller: PollerConfig) -> Backends {
        Backends::postgres(pool, self.result_ttl, poller)
            .with_result_poll_interval(self.result_poll_interval)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            queue_name: lookup("FUTURES_QUEUE_NAME")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.queue_name),
            result_ttl: lookup("FUTURES_CACHE_TTL")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.result_ttl),
            result_poll_interval: lookup("FUTURES_RESULT_POLL_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.result_poll_interval),
            database_url: lookup("DATABASE_URL").filter(|v| !v.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;

    use crate::persistence::{InMemoryResultStore, ResultRecord, ResultStore, StoreError};

    fn config(vars: &[(&str, &str)]) -> FuturesConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FuturesConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert_eq!(config, FuturesConfig::default());
        assert_eq!(config.queue_name, "futures");
        assert_eq!(config.result_ttl, Duration::from_secs(3600));
        assert_eq!(config.result_poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("FUTURES_QUEUE_NAME", "reports"),
            ("FUTURES_CACHE_TTL", "60"),
            ("FUTURES_RESULT_POLL_MS", "250"),
            ("DATABASE_URL", "postgres://localhost/futures"),
        ]);
        assert_eq!(config.queue_name, "reports");
        assert_eq!(config.result_ttl, Duration::from_secs(60));
        assert_eq!(config.result_poll_interval, Duration::from_millis(250));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/futures"));
    }

    #[test]
    fn test_unparsable_values_use_defaults() {
        let config = config(&[("FUTURES_CACHE_TTL", "soon"), ("DATABASE_URL", "")]);
        assert_eq!(config.result_ttl, DEFAULT_RESULT_TTL);
        assert!(config.database_url.is_none());
    }

    /// Result store that never pushes write notifications
    struct PollOnly(InMemoryResultStore);

    #[async_trait]
    impl ResultStore for PollOnly {
        async fn set(&self, record: ResultRecord) -> Result<(), StoreError> {
            self.0.set(record).await
        }

        async fn get(&self, uid: &str) -> Result<Option<ResultRecord>, StoreError> {
            self.0.get(uid).await
        }

        fn ttl(&self) -> Duration {
            self.0.ttl()
        }
    }

    #[tokio::test]
    async fn test_configured_queue_and_poll_interval_take_effect() {
        use std::sync::Arc;

        use crate::task::{Task, TaskRegistry, TaskResult};
        use crate::{Queue, Wait};

        fn double((x,): (i64,)) -> TaskResult<i64> {
            Ok(x * 2)
        }

        let config = config(&[
            ("FUTURES_QUEUE_NAME", "reports"),
            ("FUTURES_RESULT_POLL_MS", "20"),
        ]);
        let mut backends = config.in_memory_backends();
        assert_eq!(backends.result_poll_interval, Duration::from_millis(20));
        backends.results = Arc::new(PollOnly(InMemoryResultStore::new(config.result_ttl)));

        let task = Task::wrap("tests::double", double).with_config(&config);
        assert_eq!(task.queue_name(), "reports");
        let mut registry = TaskRegistry::new();
        registry.register(&task);

        let handle = task.submit(&backends, (21,)).await.unwrap();
        let reports = Queue::new("reports", backends.queue.clone());
        assert_eq!(reports.count().await.unwrap(), 1);
        assert_eq!(
            Queue::new(DEFAULT_QUEUE, backends.queue.clone())
                .count()
                .await
                .unwrap(),
            0
        );

        let claimed = reports.dequeue(Wait::IMMEDIATE).await.unwrap().unwrap();
        let waiter = tokio::spawn(async move { handle.wait(Wait::For(Duration::from_secs(5))).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.execute(&claimed.message, &backends).await.unwrap();

        // Without notifications only the 20 ms poll can pick the result up;
        // the 1 s default would miss this window
        let value = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("handle should poll at the configured interval")
            .unwrap()
            .unwrap();
        assert_eq!(value, Some(42));
    }
}
