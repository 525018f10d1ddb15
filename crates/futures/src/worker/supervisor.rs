//! Supervisor of a fixed pool of worker processes
//!
//! Each poll interval the supervisor checks every child for exit. A dead
//! child is respawned in restart mode, or left dead otherwise; with restart
//! off the supervisor returns once every child is gone. On shutdown it sends
//! SIGTERM to every live child, waits, and kills what is left.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::hooks::ProcessHooks;
use crate::persistence::duration_millis;

/// Shortest liveness check interval
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Number of worker processes
    pub processes: usize,

    /// Respawn processes that exit
    pub restart: bool,

    /// Liveness check interval
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Time a child gets to exit after SIGTERM before it is killed
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            processes: 1,
            restart: true,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SupervisorConfig {
    pub fn new(processes: usize) -> Self {
        Self {
            processes: processes.max(1),
            ..Default::default()
        }
    }

    /// Set restart mode
    pub fn with_restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    /// Set liveness check interval, at least [`MIN_POLL_INTERVAL`]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// A worker process could not be started
    #[error("failed to spawn worker process for slot {slot}: {source}")]
    Spawn {
        slot: usize,
        #[source]
        source: io::Error,
    },

    /// `before_spawn` hook failed
    #[error("process hook failed: {0:#}")]
    Hook(anyhow::Error),
}

/// Lifecycle notifications of worker processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A worker process was started in `slot`
    Spawned { slot: usize, pid: Option<u32> },
    /// A worker process exited on its own
    Exited {
        slot: usize,
        pid: Option<u32>,
        code: Option<i32>,
    },
    /// A worker process was stopped by the supervisor; `code` is `None`
    /// when it had to be killed
    Terminated {
        slot: usize,
        pid: Option<u32>,
        code: Option<i32>,
    },
}

/// Why [`Supervisor::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Restart mode off and every process exited
    AllStopped,
    /// Shutdown requested; live processes were terminated
    Interrupted,
}

/// Starts one worker process
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, slot: usize) -> io::Result<Child>;
}

/// Launches a program with fixed arguments
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    slot_flag: Option<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            slot_flag: None,
        }
    }

    /// Re-execute the running binary with `args`, passing the slot with `--worker-slot`
    pub fn current_exe<I, S>(args: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Ok(Self::new(std::env::current_exe()?)
            .args(args)
            .with_slot_flag("--worker-slot"))
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `<flag> <slot>` to the arguments of each launch
    pub fn with_slot_flag(mut self, flag: impl Into<String>) -> Self {
        self.slot_flag = Some(flag.into());
        self
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, slot: usize) -> io::Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        if let Some(flag) = &self.slot_flag {
            cmd.arg(flag).arg(slot.to_string());
        }
        cmd.spawn()
    }
}

/// Supervisor of worker processes
///
/// # Example
///
/// ```ignore
/// let launcher = CommandLauncher::current_exe(args.worker_args())?;
/// let supervisor = Supervisor::new(
///     SupervisorConfig::new(4).with_restart(true),
///     Arc::new(launcher),
///     hooks,
/// );
/// supervisor.run(tokio::signal::ctrl_c().map(|_| ())).await?;
/// ```
pub struct Supervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn ProcessLauncher>,
    hooks: Arc<dyn ProcessHooks>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn ProcessLauncher>,
        hooks: Arc<dyn ProcessHooks>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            launcher,
            hooks,
            events,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Observe process lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }

    async fn spawn(&self, slot: usize) -> Result<Child, SupervisorError> {
        self.hooks
            .before_spawn()
            .await
            .map_err(SupervisorError::Hook)?;

        let child = self
            .launcher
            .launch(slot)
            .map_err(|source| SupervisorError::Spawn { slot, source })?;

        let pid = child.id();
        info!(slot, ?pid, "worker process spawned");
        self.emit(SupervisorEvent::Spawned { slot, pid });
        Ok(child)
    }

    /// Supervise until `shutdown` resolves or, without restart, every
    /// process has exited.
    #[instrument(skip(self, shutdown), fields(processes = self.config.processes, restart = self.config.restart))]
    pub async fn run<F>(&self, shutdown: F) -> Result<SupervisorExit, SupervisorError>
    where
        F: Future<Output = ()>,
    {
        let mut children: Vec<Option<Child>> = Vec::with_capacity(self.config.processes);
        for slot in 0..self.config.processes {
            match self.spawn(slot).await {
                Ok(child) => children.push(Some(child)),
                Err(e) => {
                    self.terminate_all(&mut children).await;
                    return Err(e);
                }
            }
        }

        // The config fields are public, so clamp again here
        let mut ticker = tokio::time::interval(self.config.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; terminating worker processes");
                    self.terminate_all(&mut children).await;
                    return Ok(SupervisorExit::Interrupted);
                }
                _ = ticker.tick() => {}
            }

            for slot in 0..children.len() {
                self.check_slot(slot, &mut children[slot]).await;
            }

            if !self.config.restart && children.iter().all(Option::is_none) {
                info!("all worker processes exited");
                return Ok(SupervisorExit::AllStopped);
            }
        }
    }

    async fn check_slot(&self, slot: usize, entry: &mut Option<Child>) {
        if let Some(child) = entry.as_mut() {
            let pid = child.id();
            match child.try_wait() {
                Ok(Some(status)) => {
                    warn!(slot, ?pid, %status, "worker process exited");
                    self.emit(SupervisorEvent::Exited {
                        slot,
                        pid,
                        code: status.code(),
                    });
                    *entry = None;
                }
                Ok(None) => return,
                Err(e) => {
                    error!(slot, ?pid, error = %e, "failed to poll worker process");
                    return;
                }
            }
        }

        if self.config.restart {
            match self.spawn(slot).await {
                Ok(child) => *entry = Some(child),
                Err(e) => error!(slot, error = %e, "failed to respawn worker process"),
            }
        }
    }

    async fn terminate_all(&self, children: &mut [Option<Child>]) {
        let timeout = self.config.shutdown_timeout;
        let pending = children
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, entry)| entry.take().map(|child| (slot, child)))
            .map(|(slot, child)| async move {
                let pid = child.id();
                let code = terminate(child, timeout).await;
                (slot, pid, code)
            });

        for (slot, pid, code) in join_all(pending).await {
            self.emit(SupervisorEvent::Terminated { slot, pid, code });
        }
    }
}

/// SIGTERM, wait up to `grace`, then kill. Returns the exit code of a
/// process that stopped on its own.
async fn terminate(mut child: Child, grace: Duration) -> Option<i32> {
    let pid = child.id();

    #[cfg(unix)]
    if let Some(id) = pid {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Err(e) = signal::kill(Pid::from_raw(id as i32), Signal::SIGTERM) {
            warn!(pid = id, error = %e, "failed to send SIGTERM");
        }
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(?pid, %status, "worker process terminated");
            return status.code();
        }
        Ok(Err(e)) => warn!(?pid, error = %e, "failed to wait for worker process"),
        Err(_) => warn!(?pid, "worker process did not stop in time; killing"),
    }

    if let Err(e) = child.kill().await {
        error!(?pid, error = %e, "failed to kill worker process");
    }
    None
}
