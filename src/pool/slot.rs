use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tracing::warn;

/// How worker processes are launched. Workers run `<program> [--config <path>] worker --slot <i> --task-dir <dir>`.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub config_path: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: PathBuf, config_path: Option<PathBuf>) -> Self {
        Self { program, config_path }
    }

    pub fn spawn(&self, slot: usize, task_dir: &Path) -> std::io::Result<Child> {
        let mut command = Command::new(&self.program);
        if let Some(config) = &self.config_path {
            command.arg("--config").arg(config);
        }
        command
            .arg("worker")
            .arg("--slot")
            .arg(slot.to_string())
            .arg("--task-dir")
            .arg(task_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command.spawn()
    }
}

/// One worker process and the bookkeeping the pool keeps for it.
#[derive(Debug)]
pub struct WorkerSlot {
    pub index: usize,
    child: Option<Child>,
    pub pid: Option<u32>,
    pub ready: bool,
    /// No task has been assigned since the process was spawned.
    pub fresh: bool,
    pub last_assigned_at: Option<DateTime<Utc>>,
    pub spawn_count: u64,
}

impl WorkerSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            child: None,
            pid: None,
            ready: false,
            fresh: false,
            last_assigned_at: None,
            spawn_count: 0,
        }
    }

    pub fn attach(&mut self, child: Child) {
        self.pid = child.id();
        self.child = Some(child);
        self.ready = false;
        self.fresh = true;
        self.spawn_count += 1;
    }

    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn exit_status(&mut self) -> Option<std::process::ExitStatus> {
        self.child.as_mut().and_then(|c| c.try_wait().ok().flatten())
    }

    pub fn mark_assigned(&mut self) {
        self.fresh = false;
        self.last_assigned_at = Some(Utc::now());
    }

    /// Kills the process if it is still running and waits for it to be reaped.
    pub async fn terminate(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(None)) {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill worker {} (pid {:?}): {}", self.index, self.pid, e);
            }
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!("Worker {} (pid {:?}) did not exit after kill", self.index, self.pid);
            }
        }
        self.pid = None;
        self.ready = false;
        self.fresh = false;
    }

    /// Waits for a process that was asked to stop, killing it once `grace` elapses.
    pub async fn wait_or_kill(&mut self, grace: Duration) {
        if let Some(child) = self.child.as_mut() {
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                self.child = None;
                self.pid = None;
                self.ready = false;
                return;
            }
        }
        self.terminate(Duration::from_secs(5)).await;
    }
}
