//! Worker processes and their supervisor
//!
//! This module provides:
//! - [`WorkerProcess`]: a pool of worker threads in one process
//! - [`Supervisor`]: a pool of worker processes with liveness polling
//! - [`ProcessHooks`]: per-process connection setup and teardown

mod hooks;
mod process;
mod supervisor;
mod thread;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use hooks::{PostgresConnector, ProcessHooks, SharedBackends};
pub use process::{WorkerError, WorkerProcess, WorkerProcessReport};
pub use supervisor::{
    CommandLauncher, ProcessLauncher, Supervisor, SupervisorConfig, SupervisorError,
    SupervisorEvent, SupervisorExit, MIN_POLL_INTERVAL,
};
pub use thread::{ThreadReport, WorkerState};

use crate::persistence::duration_millis;
use crate::task::DEFAULT_QUEUE;
use crate::wait::Wait;

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Queue to claim from
    pub queue_name: String,

    /// How long one claim may block
    #[serde(skip, default)]
    pub wait: Wait,

    /// Worker threads per process
    pub threads: usize,

    /// Invocations per thread before it exits (0 = unlimited)
    pub limit: u64,

    /// Pause between empty non-blocking claims
    #[serde(with = "duration_millis")]
    pub idle_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE.to_string(),
            wait: Wait::IMMEDIATE,
            threads: 1,
            limit: 0,
            idle_interval: Duration::from_millis(100),
        }
    }
}

impl WorkerConfig {
    /// Create a worker configuration for a queue
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    /// Set the claim wait
    pub fn with_wait(mut self, wait: Wait) -> Self {
        self.wait = wait;
        self
    }

    /// Set the number of worker threads
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Set the per-thread invocation limit
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Set the pause between empty non-blocking claims
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.queue_name, "futures");
        assert_eq!(config.wait, Wait::IMMEDIATE);
        assert_eq!(config.threads, 1);
        assert_eq!(config.limit, 0);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::new("q")
            .with_threads(0)
            .with_limit(5)
            .with_wait(Wait::Forever)
            .with_idle_interval(Duration::from_millis(5));
        assert_eq!(config.queue_name, "q");
        assert_eq!(config.threads, 1);
        assert_eq!(config.limit, 5);
        assert_eq!(config.wait, Wait::Forever);
        assert_eq!(config.idle_interval, Duration::from_millis(5));
    }
}
