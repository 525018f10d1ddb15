//! One worker process: a fixed pool of worker threads sharing a stop flag

use std::io;
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::hooks::ProcessHooks;
use super::thread::{StateBoard, ThreadReport, WorkerState, WorkerThread};
use super::WorkerConfig;
use crate::queue::Queue;
use crate::task::{Execution, TaskRegistry};

/// Worker process errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Runtime or thread could not be started
    #[error("failed to start worker: {0}")]
    Start(#[from] io::Error),

    /// `connect` hook failed
    #[error("failed to connect backends: {0:#}")]
    Connect(anyhow::Error),

    /// `disconnect` hook failed
    #[error("failed to disconnect backends: {0:#}")]
    Disconnect(anyhow::Error),

    /// Claim or execution error in a single-shot run
    #[error("{0}")]
    Execution(String),
}

/// Totals over every thread of a worker process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProcessReport {
    pub threads: Vec<ThreadReport>,
    /// Threads that panicked instead of returning
    pub panicked: usize,
}

impl WorkerProcessReport {
    pub fn processed(&self) -> u64 {
        self.threads.iter().map(|t| t.processed).sum()
    }

    pub fn failed(&self) -> u64 {
        self.threads.iter().map(|t| t.failed).sum()
    }

    pub fn errors(&self) -> u64 {
        self.threads.iter().map(|t| t.errors).sum()
    }
}

/// A pool of worker threads in the current process
///
/// Threads are OS threads, each driving its own sequential loop on a shared
/// runtime. SIGTERM and SIGINT raise the stop flag; every thread finishes
/// its current invocation and exits.
///
/// # Example
///
/// ```ignore
/// let process = WorkerProcess::new(
///     WorkerConfig::new("q").with_threads(4),
///     Arc::new(registry),
///     Arc::new(SharedBackends(backends)),
/// );
/// let report = process.run()?;
/// ```
pub struct WorkerProcess {
    config: WorkerConfig,
    registry: Arc<TaskRegistry>,
    hooks: Arc<dyn ProcessHooks>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    states: StateBoard,
}

impl WorkerProcess {
    pub fn new(
        config: WorkerConfig,
        registry: Arc<TaskRegistry>,
        hooks: Arc<dyn ProcessHooks>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let states = StateBoard::new(config.threads);
        Self {
            config,
            registry,
            hooks,
            shutdown_tx: Arc::new(shutdown_tx),
            states,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Raising this flag stops every thread after its current invocation
    pub fn shutdown_handle(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.shutdown_tx)
    }

    /// Current state of each thread
    pub fn states(&self) -> Vec<WorkerState> {
        self.states.snapshot()
    }

    fn runtime(&self) -> io::Result<Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("futures-io")
            .enable_all()
            .build()
    }

    /// Run until every thread stopped, blocking the caller.
    ///
    /// Must not be called from within an async runtime.
    pub fn run(&self) -> Result<WorkerProcessReport, WorkerError> {
        let runtime = self.runtime()?;
        let backends = runtime
            .block_on(self.hooks.connect())
            .map_err(WorkerError::Connect)?;

        let signals = runtime.spawn(forward_signals(self.shutdown_handle()));

        info!(
            pid = std::process::id(),
            queue = %self.config.queue_name,
            threads = self.config.threads,
            limit = self.config.limit,
            "worker process started"
        );

        let mut handles = Vec::with_capacity(self.config.threads);
        for index in 0..self.config.threads {
            let worker = WorkerThread {
                thread: index,
                config: self.config.clone(),
                registry: Arc::clone(&self.registry),
                backends: backends.clone(),
                stop: self.shutdown_tx.subscribe(),
                states: self.states.clone(),
            };
            let rt = runtime.handle().clone();
            let spawned = thread::Builder::new()
                .name(format!("futures-worker-{index}"))
                .spawn(move || rt.block_on(worker.run()));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(thread = index, error = %e, "failed to start worker thread");
                    self.shutdown_tx.send_replace(true);
                    join_threads(handles);
                    signals.abort();
                    return Err(WorkerError::Start(e));
                }
            }
        }

        let report = join_threads(handles);
        signals.abort();

        runtime
            .block_on(self.hooks.disconnect(backends))
            .map_err(WorkerError::Disconnect)?;

        info!(
            pid = std::process::id(),
            processed = report.processed(),
            failed = report.failed(),
            errors = report.errors(),
            "worker process stopped"
        );
        Ok(report)
    }

    /// Claim at most one message, execute it and return.
    ///
    /// Blocks up to the configured wait for a message.
    pub fn run_once(&self) -> Result<Option<Execution>, WorkerError> {
        let runtime = self.runtime()?;
        let backends = runtime
            .block_on(self.hooks.connect())
            .map_err(WorkerError::Connect)?;

        let queue = Queue::new(self.config.queue_name.as_str(), backends.queue.clone());
        let outcome = runtime.block_on(async {
            match queue.dequeue(self.config.wait).await {
                Ok(Some(claimed)) => self
                    .registry
                    .execute(&claimed.message, &backends)
                    .await
                    .map(Some)
                    .map_err(|e| WorkerError::Execution(e.to_string())),
                Ok(None) => Ok(None),
                Err(e) => Err(WorkerError::Execution(e.to_string())),
            }
        });

        runtime
            .block_on(self.hooks.disconnect(backends))
            .map_err(WorkerError::Disconnect)?;
        outcome
    }
}

fn join_threads(handles: Vec<thread::JoinHandle<ThreadReport>>) -> WorkerProcessReport {
    let mut report = WorkerProcessReport::default();
    for handle in handles {
        match handle.join() {
            Ok(thread_report) => report.threads.push(thread_report),
            Err(_) => {
                report.panicked += 1;
                error!("worker thread panicked");
            }
        }
    }
    report
}

/// Raise the stop flag on SIGTERM or SIGINT
async fn forward_signals(stop: Arc<watch::Sender<bool>>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => info!("SIGTERM received"),
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }

    info!("stopping worker threads after their current invocation");
    stop.send_replace(true);
}
