use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ipc::{self, TaskRequest, TaskResult};
use super::slot::{WorkerCommand, WorkerSlot};
use super::PoolError;
use crate::config::PoolConfig;
use crate::error::{ErrorKind, TaskError};
use crate::schedule::processors::{JobFailure, ProgressSender, TaskProcessor};
use crate::schedule::types::{Job, JobOutput};

const RESULT_READ_ATTEMPTS: u32 = 3;
const RESULT_READ_BACKOFF: Duration = Duration::from_millis(500);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Timeout for one job: `base + duration * factor`, clamped to `[min, max]`.
pub fn compute_timeout(config: &PoolConfig, duration_seconds: f64) -> Duration {
    let scaled = config.base_timeout_secs as f64 + duration_seconds.max(0.0) * config.duration_factor;
    let clamped = scaled.clamp(config.min_timeout_secs as f64, config.max_timeout_secs as f64);
    Duration::from_secs_f64(clamped)
}

/// Progress while waiting on a worker: 10 at hand-off, approaching 90 as the expected time passes.
fn estimate_progress(elapsed: Duration, expected_seconds: f64) -> u8 {
    if expected_seconds <= 0.0 {
        return 10;
    }
    let ratio = (elapsed.as_secs_f64() / expected_seconds).min(1.0);
    10 + (ratio * 80.0) as u8
}

/// Copy of the source audio inside the task directory, removed when dropped.
struct StagedAudio {
    path: PathBuf,
}

impl StagedAudio {
    async fn stage(source: &Path, dir: &Path, slot: usize, id: &str) -> std::io::Result<Self> {
        let ext = source.extension().and_then(|e| e.to_str());
        let path = ipc::staged_audio_file(dir, slot, id, ext);
        tokio::fs::copy(source, &path).await?;
        Ok(Self { path })
    }
}

impl Drop for StagedAudio {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove staged audio {}: {}", self.path.display(), e);
            }
        }
    }
}

pub struct FileBasedPool {
    config: PoolConfig,
    command: WorkerCommand,
    slots: Vec<Arc<Mutex<WorkerSlot>>>,
    cursor: AtomicUsize,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl FileBasedPool {
    pub fn new(config: PoolConfig, command: WorkerCommand) -> Self {
        let slots = (0..config.size)
            .map(|i| Arc::new(Mutex::new(WorkerSlot::new(i))))
            .collect();
        Self {
            config,
            command,
            slots,
            cursor: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            monitor: Mutex::new(None),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn task_dir(&self) -> &Path {
        &self.config.task_dir
    }

    /// Clears stale artifacts, starts every worker and waits until all report ready.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), PoolError> {
        tokio::fs::create_dir_all(&self.config.task_dir).await?;
        clear_dir(&self.config.task_dir).await;

        let pool = self.as_ref();
        let startups = self.slots.iter().map(|slot| async move {
            let mut slot = slot.lock().await;
            pool.spawn_slot(&mut slot, true).await
        });
        futures::future::try_join_all(startups).await?;
        info!("Worker pool ready with {} workers in {}", self.size(), self.config.task_dir.display());

        self.start_monitor().await;
        Ok(())
    }

    async fn start_monitor(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let interval = self.config.health_check_interval();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pool.shutdown.cancelled() => break,
                    _ = sleep(interval) => pool.check_health().await,
                }
            }
        });
        *self.monitor.lock().await = Some(handle);
    }

    /// Respawns idle workers whose process has gone away.
    pub async fn check_health(&self) {
        for slot in &self.slots {
            let Ok(mut slot) = slot.try_lock() else {
                continue;
            };
            if slot.is_alive() {
                continue;
            }
            warn!("Worker {} (pid {:?}) is not running, respawning", slot.index, slot.pid);
            if let Err(e) = self.spawn_slot(&mut slot, false).await {
                error!("Failed to respawn worker {}: {}", slot.index, e);
            }
        }
    }

    async fn clear_slot_files(&self, index: usize) {
        let mut entries = match tokio::fs::read_dir(&self.config.task_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot list {}: {}", self.config.task_dir.display(), e);
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if ipc::belongs_to_slot(&name.to_string_lossy(), index) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }

    /// Replaces the slot's process. With `wait_ready` the call returns once the new worker
    /// has written its ready sentinel.
    async fn spawn_slot(&self, slot: &mut WorkerSlot, wait_ready: bool) -> Result<(), PoolError> {
        slot.terminate(KILL_WAIT).await;
        self.clear_slot_files(slot.index).await;

        let child = self
            .command
            .spawn(slot.index, &self.config.task_dir)
            .map_err(|e| PoolError::Startup {
                slot: slot.index,
                message: format!("spawn {}: {}", self.command.program.display(), e),
            })?;
        slot.attach(child);
        debug!("Spawned worker {} (pid {:?})", slot.index, slot.pid);

        if wait_ready {
            self.wait_ready(slot).await?;
        }
        Ok(())
    }

    async fn wait_ready(&self, slot: &mut WorkerSlot) -> Result<(), PoolError> {
        let sentinel = ipc::ready_file(&self.config.task_dir, slot.index);
        let deadline = Instant::now() + self.config.ready_timeout();
        loop {
            if sentinel.exists() {
                slot.ready = true;
                info!("Worker {} ready (pid {:?})", slot.index, slot.pid);
                return Ok(());
            }
            if let Some(status) = slot.exit_status() {
                slot.terminate(KILL_WAIT).await;
                return Err(PoolError::Startup {
                    slot: slot.index,
                    message: format!("exited during startup with {}", status),
                });
            }
            if self.shutdown.is_cancelled() {
                return Err(PoolError::ShuttingDown);
            }
            if Instant::now() >= deadline {
                slot.terminate(KILL_WAIT).await;
                return Err(PoolError::Startup {
                    slot: slot.index,
                    message: format!("not ready after {}s", self.config.ready_timeout_secs),
                });
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    async fn ensure_ready(&self, slot: &mut WorkerSlot) -> Result<(), PoolError> {
        if !slot.is_alive() {
            warn!("Worker {} is down at assignment, respawning", slot.index);
            return self.spawn_slot(slot, true).await;
        }
        if !slot.ready {
            self.wait_ready(slot).await?;
        }
        Ok(())
    }

    /// First free slot starting from the round-robin cursor, or the cursor slot once it frees up.
    async fn acquire(&self) -> OwnedMutexGuard<WorkerSlot> {
        let n = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            if let Ok(guard) = self.slots[(start + offset) % n].clone().try_lock_owned() {
                return guard;
            }
        }
        self.slots[start].clone().lock_owned().await
    }

    async fn read_result(&self, path: &Path, binary: bool) -> Result<TaskResult, PoolError> {
        let mut last_error = None;
        for attempt in 1..=RESULT_READ_ATTEMPTS {
            match tokio::fs::read(path).await {
                Ok(bytes) => match ipc::decode_result(&bytes, binary) {
                    Ok(result) => return Ok(result),
                    Err(e) => last_error = Some(e.to_string()),
                },
                Err(e) => last_error = Some(e.to_string()),
            }
            if attempt < RESULT_READ_ATTEMPTS {
                sleep(RESULT_READ_BACKOFF).await;
            }
        }
        Err(PoolError::Ipc(format!(
            "unreadable result {}: {}",
            path.display(),
            last_error.unwrap_or_default()
        )))
    }

    /// Runs one job on a slot. The slot is recycled after every result, successful or not.
    pub async fn run(&self, job: &Job, progress: ProgressSender) -> Result<JobOutput, JobFailure> {
        if self.shutdown.is_cancelled() {
            return Err(JobFailure::new(None, PoolError::ShuttingDown));
        }

        let mut slot = self.acquire().await;
        let index = slot.index;
        slot.mark_assigned();
        self.run_on_slot(&mut slot, job, progress)
            .await
            .map_err(|error| JobFailure::new(Some(index), error))
    }

    async fn run_on_slot(
        &self,
        slot: &mut WorkerSlot,
        job: &Job,
        progress: ProgressSender,
    ) -> Result<JobOutput, PoolError> {
        let dir = self.config.task_dir.as_path();
        let index = slot.index;
        self.ensure_ready(slot).await?;
        slot.mark_assigned();

        let ipc_id = job.ipc_id();
        let staged = StagedAudio::stage(&job.audio_path, dir, index, &ipc_id)
            .await
            .map_err(|e| PoolError::Engine(TaskError::from(e)))?;
        let request = TaskRequest {
            task_id: ipc_id.clone(),
            audio_path: staged.path.clone(),
            batch_size_s: job.params.batch_size_seconds,
            hotword: job.params.hotword.clone(),
            use_binary: false,
        };
        let request_bytes = ipc::encode_request(&request)?;
        let request_path = ipc::request_file(dir, index, &ipc_id);
        ipc::write_atomic_async(&request_path, request_bytes.clone()).await?;
        let _ = progress.send(10);
        info!("Task {} assigned to worker {} (pid {:?})", job.task_id, index, slot.pid);

        let timeout = compute_timeout(&self.config, job.duration_seconds);
        let started = Instant::now();
        let mut deadline = started + timeout;
        let mut resubmitted = false;
        let mut reported = 10u8;

        loop {
            if let Some((path, binary)) = ipc::find_result(dir, index, &ipc_id) {
                if !request_path.exists() {
                    let outcome = self.read_result(&path, binary).await;
                    let _ = tokio::fs::remove_file(&path).await;
                    self.recycle_locked(slot).await;
                    return self.interpret(job, index, outcome?);
                }
            }

            if !slot.is_alive() {
                let status = slot.exit_status();
                if resubmitted {
                    let _ = tokio::fs::remove_file(&request_path).await;
                    error!("Worker {} exited again ({:?}) running {}", index, status, job.task_id);
                    self.recycle_locked(slot).await;
                    return Err(PoolError::WorkerCrashed {
                        slot: index,
                        task_id: job.task_id.clone(),
                    });
                }
                warn!("Worker {} exited ({:?}) running {}, resubmitting once", index, status, job.task_id);
                resubmitted = true;
                self.spawn_slot(slot, true).await?;
                slot.mark_assigned();
                ipc::write_atomic_async(&request_path, request_bytes.clone()).await?;
                deadline = Instant::now() + timeout;
                continue;
            }

            if self.shutdown.is_cancelled() {
                let _ = tokio::fs::remove_file(&request_path).await;
                return Err(PoolError::ShuttingDown);
            }

            if Instant::now() >= deadline {
                let _ = tokio::fs::remove_file(&request_path).await;
                warn!("Task {} timed out on worker {} after {:?}", job.task_id, index, timeout);
                // the stuck process must be gone before the slot is released
                self.recycle_locked(slot).await;
                return Err(PoolError::Timeout {
                    task_id: job.task_id.clone(),
                    seconds: timeout.as_secs(),
                });
            }

            let estimate = estimate_progress(started.elapsed(), job.expected_seconds);
            if estimate > reported {
                reported = estimate;
                let _ = progress.send(estimate);
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    fn interpret(&self, job: &Job, index: usize, result: TaskResult) -> Result<JobOutput, PoolError> {
        if result.success {
            return match result.result {
                Some(raw) => Ok(JobOutput {
                    raw,
                    slot: index,
                    worker_pid: Some(result.worker_pid),
                }),
                None => Err(PoolError::Engine(TaskError::new(
                    ErrorKind::EngineFault,
                    "worker reported success without a transcript",
                ))),
            };
        }

        if let Some(traceback) = &result.traceback {
            warn!("Worker {} traceback for {}:\n{}", index, job.task_id, traceback);
        }
        Err(PoolError::Engine(TaskError::new(
            result.error_type.unwrap_or(ErrorKind::EngineFault),
            result.error.unwrap_or_else(|| "worker reported failure".to_string()),
        )))
    }

    async fn recycle_locked(&self, slot: &mut WorkerSlot) {
        if let Err(e) = self.spawn_slot(slot, false).await {
            error!("Failed to recycle worker {}: {}", slot.index, e);
        }
    }

    /// Replaces the slot's process unless it has not run anything since its last spawn.
    pub async fn recycle_slot(&self, index: usize) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        let mut slot = slot.lock().await;
        if slot.fresh && slot.is_alive() {
            debug!("Worker {} already fresh, skipping recycle", index);
            return;
        }
        info!("Recycling worker {}", index);
        self.recycle_locked(&mut slot).await;
    }

    /// Asks every worker to stop, kills stragglers after the grace period and clears the task directory.
    pub async fn shutdown_workers(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
        }

        let mut guards = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            guards.push(slot.lock().await);
        }
        for slot in &guards {
            let stop = ipc::stop_file(&self.config.task_dir, slot.index);
            if let Err(e) = ipc::write_atomic_async(&stop, Vec::new()).await {
                warn!("Failed to write stop sentinel for worker {}: {}", slot.index, e);
            }
        }

        let deadline = Instant::now() + self.config.shutdown_grace();
        for slot in guards.iter_mut() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            slot.wait_or_kill(remaining).await;
        }

        clear_dir(&self.config.task_dir).await;
        info!("Worker pool stopped");
    }

    pub async fn worker_pids(&self) -> Vec<Option<u32>> {
        let mut pids = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            pids.push(slot.lock().await.pid);
        }
        pids
    }
}

async fn clear_dir(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let removed = match entry.file_type().await {
            Ok(t) if t.is_dir() => tokio::fs::remove_dir_all(&path).await,
            _ => tokio::fs::remove_file(&path).await,
        };
        if let Err(e) = removed {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl TaskProcessor for FileBasedPool {
    async fn process(&self, job: &Job, progress: ProgressSender) -> Result<JobOutput, JobFailure> {
        self.run(job, progress).await
    }

    async fn recycle(&self, slot: usize) {
        self.recycle_slot(slot).await;
    }

    fn concurrency(&self) -> usize {
        self.size()
    }

    async fn shutdown(&self) {
        self.shutdown_workers().await;
    }
}
