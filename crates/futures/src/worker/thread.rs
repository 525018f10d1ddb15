//! The sequential claim, execute, record loop of one worker thread

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use super::WorkerConfig;
use crate::persistence::{Backends, ClaimPoller, PollerConfig};
use crate::queue::Queue;
use crate::task::TaskRegistry;

/// Longest single claim; keeps indefinite waits responsive to the stop flag
pub(crate) const CLAIM_SLICE: Duration = Duration::from_secs(1);

/// Worker thread lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Claiming messages
    Running,
    /// Running a task function
    Executing,
    /// Stop flag or limit observed; leaving the loop
    Stopping,
    /// Loop exited
    Stopped,
}

/// What one worker thread did before it stopped
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadReport {
    pub thread: usize,
    /// Messages claimed, whatever their outcome
    pub processed: u64,
    /// Invocations whose function failed
    pub failed: u64,
    /// Claim or execution machinery errors
    pub errors: u64,
}

/// Shared view of every thread's state in one worker process
#[derive(Debug, Clone)]
pub(crate) struct StateBoard(Arc<RwLock<Vec<WorkerState>>>);

impl StateBoard {
    pub(crate) fn new(threads: usize) -> Self {
        Self(Arc::new(RwLock::new(vec![WorkerState::Running; threads])))
    }

    pub(crate) fn set(&self, thread: usize, state: WorkerState) {
        if let Some(slot) = self.0.write().get_mut(thread) {
            *slot = state;
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<WorkerState> {
        self.0.read().clone()
    }
}

pub(crate) struct WorkerThread {
    pub(crate) thread: usize,
    pub(crate) config: WorkerConfig,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) backends: Backends,
    pub(crate) stop: watch::Receiver<bool>,
    pub(crate) states: StateBoard,
}

impl WorkerThread {
    pub(crate) async fn run(mut self) -> ThreadReport {
        let queue = Queue::new(self.config.queue_name.as_str(), self.backends.queue.clone());
        let mut report = ThreadReport {
            thread: self.thread,
            ..Default::default()
        };
        let mut backoff = ClaimPoller::new(
            PollerConfig::new()
                .with_min_interval(self.config.idle_interval)
                .with_max_interval(Duration::from_secs(5)),
        );

        debug!(thread = self.thread, queue = %queue.name(), "worker thread started");

        loop {
            if *self.stop.borrow() {
                debug!(thread = self.thread, "stop flag observed");
                break;
            }
            if self.config.limit > 0 && report.processed >= self.config.limit {
                info!(thread = self.thread, limit = self.config.limit, "invocation limit reached");
                break;
            }

            match queue.dequeue(self.config.wait.capped(CLAIM_SLICE)).await {
                Ok(Some(claimed)) => {
                    backoff.reset();
                    report.processed += 1;
                    self.states.set(self.thread, WorkerState::Executing);

                    match self.registry.execute(&claimed.message, &self.backends).await {
                        Ok(execution) => {
                            if execution.failed {
                                report.failed += 1;
                            }
                        }
                        Err(e) => {
                            report.errors += 1;
                            error!(
                                thread = self.thread,
                                uid = %claimed.message.uid,
                                task = %claimed.message.name,
                                error = %e,
                                "failed to execute message"
                            );
                        }
                    }

                    self.states.set(self.thread, WorkerState::Running);
                }
                Ok(None) => {
                    trace!(thread = self.thread, "no message claimed");
                    if self.config.wait.is_immediate() {
                        self.pause(self.config.idle_interval).await;
                    }
                }
                Err(e) => {
                    report.errors += 1;
                    error!(thread = self.thread, error = %e, "failed to claim message");
                    self.pause(backoff.next_interval()).await;
                }
            }
        }

        self.states.set(self.thread, WorkerState::Stopping);
        debug!(
            thread = self.thread,
            processed = report.processed,
            failed = report.failed,
            errors = report.errors,
            "worker thread stopping"
        );
        self.states.set(self.thread, WorkerState::Stopped);
        report
    }

    /// Sleep, waking early when the stop flag is raised
    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stop.changed() => {}
        }
    }
}
