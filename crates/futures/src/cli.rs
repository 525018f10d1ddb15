// Worker-pool executable surface
//
// Design Decision: One binary plays both roles. Without `--worker` it is the
// supervisor and re-executes itself with `--worker` for every process slot.
// Design Decision: `--once` claims a single message in-process, no supervisor.

use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tracing::{info, warn};

use crate::config::FuturesConfig;
use crate::task::{TaskRegistry, DEFAULT_QUEUE};
use crate::wait::Wait;
use crate::worker::{
    CommandLauncher, ProcessHooks, Supervisor, SupervisorConfig, SupervisorExit, WorkerConfig,
    WorkerProcess,
};

/// Executor command-line arguments
#[derive(Debug, Clone, Parser)]
#[command(name = "futures-executor")]
#[command(about = "Execute queued futures with a pool of worker processes and threads")]
#[command(version)]
pub struct ExecutorArgs {
    /// The queue to monitor [default: `FUTURES_QUEUE_NAME` or "futures"]
    #[arg(long)]
    pub queue_name: Option<String>,

    /// Seconds a claim may block (0 = do not block, negative = forever)
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub wait: i64,

    /// Number of worker processes
    #[arg(long, default_value_t = 1)]
    pub processes: usize,

    /// Worker threads per process
    #[arg(long, default_value_t = 1)]
    pub threads: usize,

    /// Invocations per thread before it exits (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub limit: u64,

    /// Respawn worker processes that exit
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub restart: bool,

    /// Seconds between worker liveness checks
    #[arg(long, default_value = "1", value_parser = parse_seconds)]
    pub poll_interval: Duration,

    /// Claim and execute a single message in this process, then exit
    #[arg(long)]
    pub once: bool,

    /// Run as a worker process (set by the supervisor)
    #[arg(long, hide = true)]
    pub worker: bool,

    /// Process slot of this worker (set by the supervisor)
    #[arg(long, hide = true)]
    pub worker_slot: Option<usize>,
}

impl ExecutorArgs {
    /// Fill in what the command line left to the deployment configuration
    pub fn with_config(mut self, config: &FuturesConfig) -> Self {
        if self.queue_name.is_none() {
            self.queue_name = Some(config.queue_name.clone());
        }
        self
    }

    /// The queue to monitor
    pub fn queue_name(&self) -> &str {
        self.queue_name.as_deref().unwrap_or(DEFAULT_QUEUE)
    }

    /// Configuration of each worker process
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(self.queue_name())
            .with_wait(Wait::from_secs(self.wait))
            .with_threads(self.threads)
            .with_limit(self.limit)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig::new(self.processes)
            .with_restart(self.restart)
            .with_poll_interval(self.poll_interval)
    }

    /// Arguments a worker process is started with
    pub fn worker_args(&self) -> Vec<String> {
        vec![
            "--worker".to_string(),
            "--queue-name".to_string(),
            self.queue_name().to_string(),
            format!("--wait={}", self.wait),
            "--threads".to_string(),
            self.threads.to_string(),
            "--limit".to_string(),
            self.limit.to_string(),
        ]
    }
}

/// Fractional seconds into a duration
fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|e| format!("`{value}` is not a number: {e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("`{value}` is not a valid interval: {e}"))
}

/// Run the executor in the role selected by `args`
pub fn run(
    args: ExecutorArgs,
    registry: Arc<TaskRegistry>,
    hooks: Arc<dyn ProcessHooks>,
) -> anyhow::Result<ExitCode> {
    if registry.is_empty() {
        warn!("no tasks registered; every claimed message will fail to execute");
    }

    if args.once {
        let process = WorkerProcess::new(args.worker_config(), registry, hooks);
        return match process.run_once().context("single execution failed")? {
            Some(execution) => {
                info!(uid = %execution.uid, task = %execution.name, failed = execution.failed, "executed one message");
                Ok(ExitCode::SUCCESS)
            }
            None => {
                info!(queue = %args.queue_name(), "queue empty");
                Ok(ExitCode::SUCCESS)
            }
        };
    }

    if args.worker {
        let process = WorkerProcess::new(args.worker_config(), registry, hooks);
        let report = process.run().context("worker process failed")?;
        info!(slot = ?args.worker_slot, processed = report.processed(), "worker process exiting");
        return Ok(if report.panicked > 0 {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        });
    }

    let launcher = CommandLauncher::current_exe(args.worker_args())
        .context("failed to locate the executor binary")?;
    let supervisor = Supervisor::new(args.supervisor_config(), Arc::new(launcher), hooks);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    let exit = runtime
        .block_on(supervisor.run(shutdown_signal()))
        .context("supervisor failed")?;

    match exit {
        SupervisorExit::AllStopped => info!("all worker processes finished"),
        SupervisorExit::Interrupted => info!("executor interrupted"),
    }
    Ok(ExitCode::SUCCESS)
}

/// Resolves on SIGINT or SIGTERM
fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = term.recv() => {}
                        _ = tokio::signal::ctrl_c() => {}
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
        }
    }
}
