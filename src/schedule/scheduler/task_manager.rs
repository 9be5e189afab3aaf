use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::asr::{RawTranscript, TranscribeParams};
use crate::audio::probe_duration;
use crate::cache::CacheGateway;
use crate::config::TranscriptionConfig;
use crate::error::{ErrorKind, TaskError};
use crate::schedule::callback::NotificationSink;
use crate::schedule::processors::{JobFailure, TaskProcessor};
use crate::schedule::types::{
    FinalizeOutcome, Job, JobOutput, QueueInfo, SubmitOutcome, SubmitRequest, Task, TaskState, TaskStats,
};
use crate::transcript::{self, TranscriptMeta, TranscriptOutput};
use crate::upload::validate::validate_submit;

const IDLE_POLL: Duration = Duration::from_secs(1);

/// Failures caused by the input itself. Running them again cannot help.
pub fn should_retry(kind: ErrorKind) -> bool {
    !matches!(
        kind,
        ErrorKind::InvalidAudio
            | ErrorKind::AudioTooShort
            | ErrorKind::FileNotFound
            | ErrorKind::UnsupportedFormat
            | ErrorKind::FileTooLarge
            | ErrorKind::AuthFailed
            | ErrorKind::HashMismatch
            | ErrorKind::SizeMismatch
            | ErrorKind::UploadAbandoned
            | ErrorKind::QueueFull
            | ErrorKind::Cancelled
            | ErrorKind::TaskNotFound
            | ErrorKind::SessionNotFound
            | ErrorKind::ChunkRejected
            | ErrorKind::InvalidMessage
    )
}

/// Tasks waiting on the first queued or running task with the same content.
#[derive(Debug)]
struct InflightGroup {
    leader: String,
    followers: Vec<String>,
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, Task>,
    queue: VecDeque<String>,
    inflight: HashMap<String, InflightGroup>,
    /// Bumped each time a result for the hash reaches the cache.
    stored: HashMap<String, u64>,
}

impl Registry {
    fn queued_audio_seconds(&self) -> f64 {
        self.queue
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|t| t.duration_seconds.unwrap_or(0.0))
            .sum()
    }

    fn stored_generation(&self, hash: &str) -> u64 {
        self.stored.get(hash).copied().unwrap_or(0)
    }

    fn remove_follower(&mut self, hash: &str, task_id: &str) {
        if let Some(group) = self.inflight.get_mut(hash) {
            group.followers.retain(|id| id != task_id);
        }
    }

    /// Hands a group whose leader will never produce a result to its first waiting follower.
    fn promote(&mut self, hash: &str) -> Option<String> {
        let group = self.inflight.remove(hash)?;
        let mut waiting = group
            .followers
            .into_iter()
            .filter(|id| self.tasks.get(id).map(|t| t.state == TaskState::Pending).unwrap_or(false));
        let leader = waiting.next()?;
        let followers = waiting.collect();
        self.queue.push_back(leader.clone());
        self.inflight.insert(
            hash.to_string(),
            InflightGroup {
                leader: leader.clone(),
                followers,
            },
        );
        Some(leader)
    }
}

enum Notice {
    Progress {
        task_id: String,
        percent: u8,
        status: TaskState,
        message: String,
    },
    Complete {
        task_id: String,
        result: TranscriptOutput,
    },
    Error {
        task_id: String,
        error: TaskError,
    },
}

impl Notice {
    fn progress(task: &Task, message: impl Into<String>) -> Self {
        Notice::Progress {
            task_id: task.id.clone(),
            percent: task.progress,
            status: task.state,
            message: message.into(),
        }
    }
}

fn advance(task: &mut Task, next: TaskState) -> bool {
    match task.transition(next) {
        Ok(()) => true,
        Err(e) => {
            error!("{}", e);
            false
        }
    }
}

fn complete_with(task: &mut Task, result: TranscriptOutput, notices: &mut Vec<Notice>) {
    if !advance(task, TaskState::Completed) {
        return;
    }
    task.progress = 100;
    task.error = None;
    task.result = Some(result.clone());
    notices.push(Notice::progress(task, "completed"));
    notices.push(Notice::Complete {
        task_id: task.id.clone(),
        result,
    });
}

pub struct TaskManager {
    config: TranscriptionConfig,
    cache: Arc<CacheGateway>,
    processor: Arc<dyn TaskProcessor>,
    sink: Arc<dyn NotificationSink>,
    registry: Mutex<Registry>,
    queue_signal: Notify,
    shutdown: CancellationToken,
}

impl TaskManager {
    pub fn new(
        config: TranscriptionConfig,
        cache: Arc<CacheGateway>,
        processor: Arc<dyn TaskProcessor>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            cache,
            processor,
            sink,
            registry: Mutex::new(Registry::default()),
            queue_signal: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.processor.concurrency()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn emit(&self, notices: Vec<Notice>) {
        for notice in notices {
            let outcome = match &notice {
                Notice::Progress {
                    task_id,
                    percent,
                    status,
                    message,
                } => self.sink.on_progress(task_id, *percent, *status, message).await,
                Notice::Complete { task_id, result } => self.sink.on_complete(task_id, result).await,
                Notice::Error { task_id, error } => self.sink.on_error(task_id, error).await,
            };
            if let Err(e) = outcome {
                warn!("Notification failed: {}", e);
            }
        }
    }

    async fn cached_result(&self, hash: &str, task: &Task) -> Option<TranscriptOutput> {
        match self.cache.lookup(hash, task.output_format).await {
            Ok(hit) => hit.map(|r| r.for_task(&task.id, &task.file_name)),
            Err(e) => {
                warn!("Cache lookup for {} failed, treating as miss: {}", hash, e);
                None
            }
        }
    }

    /// Deletes the source files of `hash` once no pending or running task refers to them.
    /// Runs under the registry lock so a concurrent transition cannot slip in between.
    async fn release_files(&self, registry: &Registry, hash: &str, extra: Option<&Path>) {
        if !self.config.delete_after_transcription {
            return;
        }
        if registry
            .tasks
            .values()
            .any(|t| t.content_hash == hash && t.state.is_active())
        {
            debug!("Keeping files of {}: still referenced", hash);
            return;
        }
        let mut paths: HashSet<&Path> = registry
            .tasks
            .values()
            .filter(|t| t.content_hash == hash)
            .filter_map(|t| t.file_path.as_deref())
            .collect();
        if let Some(extra) = extra {
            paths.insert(extra);
        }
        for path in paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!("Deleted source file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
            }
        }
    }

    /// Registers a new task. A cache hit completes it on the spot.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, TaskError> {
        validate_submit(&request, &self.config)?;
        let mut task = Task::new(request);
        let hash = task.content_hash.clone();

        let mut notices = Vec::new();
        let cached = if task.force_refresh {
            None
        } else {
            self.cached_result(&hash, &task).await
        };

        let outcome = match cached {
            Some(result) => {
                info!("Task {} served from cache ({})", task.id, hash);
                complete_with(&mut task, result, &mut notices);
                SubmitOutcome::Cached(task.clone())
            }
            None => {
                info!("Creating new task: {} ({})", task.id, task.file_name);
                SubmitOutcome::Accepted(task.clone())
            }
        };
        self.registry.lock().await.tasks.insert(task.id.clone(), task);
        self.emit(notices).await;
        Ok(outcome)
    }

    /// Attaches the uploaded file to a pending task, checks the cache again and queues it.
    pub async fn finalize_upload(&self, task_id: &str, file_path: PathBuf) -> Result<FinalizeOutcome, TaskError> {
        let snapshot = self
            .get_task(task_id)
            .await
            .ok_or_else(|| TaskError::not_found(task_id))?;
        if snapshot.state != TaskState::Pending || snapshot.file_path.is_some() {
            return Err(TaskError::new(
                ErrorKind::InvalidMessage,
                format!("task {} is {} and cannot take an upload", task_id, snapshot.state),
            ));
        }

        let probe_path = file_path.clone();
        let probed = tokio::task::spawn_blocking(move || probe_duration(&probe_path))
            .await
            .map_err(TaskError::internal)
            .and_then(|r| r);
        let duration = match probed {
            Ok(d) => d,
            Err(e) => {
                warn!("Rejecting upload for {}: {}", task_id, e);
                self.reject_upload_with_file(task_id, e.clone(), Some(&file_path), false).await;
                return Err(e);
            }
        };

        let hash = snapshot.content_hash.clone();
        let generation = self.registry.lock().await.stored_generation(&hash);
        let mut cached = if snapshot.force_refresh {
            None
        } else {
            self.cached_result(&hash, &snapshot).await
        };

        let mut notices = Vec::new();
        let mut registry = self.registry.lock().await;
        if cached.is_none() && !snapshot.force_refresh && registry.stored_generation(&hash) != generation {
            // a result landed while the lookup ran; its group is already gone
            debug!("Result for {} arrived during lookup, checking cache again", hash);
            cached = self.cached_result(&hash, &snapshot).await;
        }

        let Some(task) = registry.tasks.get_mut(task_id) else {
            self.release_files(&registry, &hash, Some(&file_path)).await;
            return Err(TaskError::not_found(task_id));
        };
        if task.state != TaskState::Pending {
            let state = task.state;
            self.release_files(&registry, &hash, Some(&file_path)).await;
            return Err(TaskError::new(
                ErrorKind::Cancelled,
                format!("task {} is {}", task_id, state),
            ));
        }
        task.file_path = Some(file_path.clone());
        task.duration_seconds = Some(duration);
        task.updated_at = Utc::now();

        if let Some(result) = cached {
            info!("Task {} served from cache after upload", task_id);
            complete_with(task, result, &mut notices);
            let done = task.clone();
            self.release_files(&registry, &hash, None).await;
            drop(registry);
            self.emit(notices).await;
            return Ok(FinalizeOutcome::Cached(done));
        }

        if !snapshot.force_refresh {
            let leader = registry
                .inflight
                .get(&hash)
                .map(|g| g.leader.clone())
                .filter(|leader| leader != task_id);
            if let Some(leader_id) = leader {
                if let Some(group) = registry.inflight.get_mut(&hash) {
                    group.followers.push(task_id.to_string());
                }
                info!("Task {} joins in-flight task {} for {}", task_id, leader_id, hash);
                let task = registry.tasks.get(task_id).cloned().ok_or_else(|| TaskError::not_found(task_id))?;
                return Ok(FinalizeOutcome::Joined { task, leader_id });
            }
        }

        if registry.queue.len() >= self.config.max_queue_size {
            let error = TaskError::new(
                ErrorKind::QueueFull,
                format!("queue is full ({} tasks)", self.config.max_queue_size),
            );
            registry.tasks.remove(task_id);
            self.release_files(&registry, &hash, Some(&file_path)).await;
            drop(registry);
            warn!("Rejecting task {}: {}", task_id, error);
            return Err(error);
        }

        registry.queue.push_back(task_id.to_string());
        if !snapshot.force_refresh {
            registry.inflight.entry(hash.clone()).or_insert_with(|| InflightGroup {
                leader: task_id.to_string(),
                followers: Vec::new(),
            });
        }
        let position = registry.queue.len();
        let queue = QueueInfo {
            position,
            queue_depth: position,
            estimated_wait_minutes: (registry.queued_audio_seconds() / self.config.speed_ratio * 100.0).round()
                / 100.0,
        };
        let task = registry.tasks.get(task_id).cloned().ok_or_else(|| TaskError::not_found(task_id))?;
        drop(registry);

        self.queue_signal.notify_one();
        info!(
            "Task {} queued at position {} ({:.1}s of audio, ~{} min wait)",
            task_id, queue.position, duration, queue.estimated_wait_minutes
        );
        Ok(FinalizeOutcome::Queued { task, queue })
    }

    /// Waits for the next pending task and moves it to processing. Returns `None` on shutdown.
    pub async fn next_job(&self) -> Option<Job> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            let notified = self.queue_signal.notified();
            {
                let mut registry = self.registry.lock().await;
                while let Some(id) = registry.queue.pop_front() {
                    let Some(task) = registry.tasks.get_mut(&id) else {
                        continue;
                    };
                    if task.state != TaskState::Pending {
                        debug!("Skipping {} task {}", task.state, id);
                        continue;
                    }
                    let Some(audio_path) = task.file_path.clone() else {
                        warn!("Task {} queued without a file", id);
                        continue;
                    };
                    if !advance(task, TaskState::Processing) {
                        continue;
                    }
                    let duration = task.duration_seconds.unwrap_or(0.0);
                    return Some(Job {
                        task_id: id,
                        attempt: task.retry_count,
                        audio_path,
                        duration_seconds: duration,
                        expected_seconds: duration * 60.0 / self.config.speed_ratio,
                        params: TranscribeParams {
                            batch_size_seconds: self.config.batch_size_s,
                            hotword: self.config.hotword.clone(),
                        },
                    });
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shutdown.cancelled() => return None,
                _ = sleep(IDLE_POLL) => {}
            }
        }
    }

    /// Runs one job on the processor and records the outcome.
    pub async fn process_job(self: &Arc<Self>, job: Job) {
        let notice = self
            .registry
            .lock()
            .await
            .tasks
            .get(&job.task_id)
            .map(|task| Notice::progress(task, "processing"));
        if let Some(notice) = notice {
            self.emit(vec![notice]).await;
        }

        let started = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = self.processor.process(&job, tx);
        tokio::pin!(run);
        let outcome = loop {
            tokio::select! {
                biased;
                Some(percent) = rx.recv() => self.update_progress(&job.task_id, percent).await,
                outcome = &mut run => break outcome,
            }
        };
        while let Ok(percent) = rx.try_recv() {
            self.update_progress(&job.task_id, percent).await;
        }

        match outcome {
            Ok(output) => self.complete_from_pool(&job, output, started.elapsed()).await,
            Err(failure) => self.handle_failure(&job, failure).await,
        }
    }

    async fn update_progress(&self, task_id: &str, percent: u8) {
        let mut registry = self.registry.lock().await;
        let Some(task) = registry.tasks.get_mut(task_id) else {
            return;
        };
        // 100 is reserved for completion
        let percent = percent.min(99);
        if task.state != TaskState::Processing || percent <= task.progress {
            return;
        }
        task.progress = percent;
        task.updated_at = Utc::now();
        let notice = Notice::progress(task, "transcribing");
        drop(registry);
        self.emit(vec![notice]).await;
    }

    async fn complete_from_pool(&self, job: &Job, output: JobOutput, elapsed: Duration) {
        let Some(snapshot) = self.get_task(&job.task_id).await else {
            warn!("Task {} disappeared before its result arrived", job.task_id);
            return;
        };
        let hash = snapshot.content_hash.clone();
        let meta = |task: &Task| TranscriptMeta {
            task_id: task.id.clone(),
            file_name: task.file_name.clone(),
            file_hash: hash.clone(),
            duration: job.duration_seconds,
            processing_time: elapsed.as_secs_f64(),
        };
        let merge_gap = self.config.merge_gap_seconds;
        let transcript = transcript::build_transcript(&output.raw, meta(&snapshot), merge_gap);
        let requested = match snapshot.output_format {
            transcript::OutputFormat::Json => TranscriptOutput::Json(transcript.clone()),
            transcript::OutputFormat::Srt => TranscriptOutput::Srt(transcript::render_srt(&output.raw)),
        };
        if let Err(e) = self.cache.store(&transcript, &output.raw, &requested).await {
            warn!("Failed to cache result of {}: {}", job.task_id, e);
        }

        let mut notices = Vec::new();
        let mut registry = self.registry.lock().await;
        *registry.stored.entry(hash.clone()).or_insert(0) += 1;
        let followers = self.take_group(&mut registry, &hash, &job.task_id);

        if let Some(task) = registry.tasks.get_mut(&job.task_id) {
            if task.state == TaskState::Processing {
                info!(
                    "Task {} completed on worker {} (pid {:?}) in {:.1}s",
                    job.task_id,
                    output.slot,
                    output.worker_pid,
                    elapsed.as_secs_f64()
                );
                complete_with(task, requested, &mut notices);
            } else {
                info!("Discarding result of {} task {}", task.state, job.task_id);
            }
        }

        for id in followers {
            if let Some(task) = registry.tasks.get_mut(&id) {
                if task.state != TaskState::Pending {
                    continue;
                }
                let result = render_for(task, &output.raw, meta(&*task), merge_gap);
                info!("Task {} completed from identical task {}", id, job.task_id);
                complete_with(task, result, &mut notices);
            }
        }

        self.release_files(&registry, &hash, None).await;
        drop(registry);
        self.emit(notices).await;
    }

    /// Removes and returns the followers of `hash` when `task_id` leads its group.
    fn take_group(&self, registry: &mut Registry, hash: &str, task_id: &str) -> Vec<String> {
        match registry.inflight.get(hash) {
            Some(group) if group.leader == task_id => registry
                .inflight
                .remove(hash)
                .map(|g| g.followers)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    async fn handle_failure(self: &Arc<Self>, job: &Job, failure: JobFailure) {
        let error = failure.error.to_task_error();
        let kind = error.error_type;

        if let Some(slot) = failure.slot {
            if matches!(kind, ErrorKind::EngineFault | ErrorKind::Timeout | ErrorKind::WorkerCrashed) {
                self.processor.recycle(slot).await;
            }
        }

        let mut notices = Vec::new();
        let mut registry = self.registry.lock().await;
        let Some(task) = registry.tasks.get_mut(&job.task_id) else {
            return;
        };
        let hash = task.content_hash.clone();

        if task.state == TaskState::Processing {
            advance(task, TaskState::Failed);
            task.error = Some(error.clone());

            if should_retry(kind) && task.retry_count < self.config.retry_times {
                task.retry_count += 1;
                advance(task, TaskState::Pending);
                let attempt = task.retry_count;
                warn!(
                    "Retrying task {} (attempt {}/{}) after {}",
                    job.task_id, attempt, self.config.retry_times, error
                );
                notices.push(Notice::progress(
                    task,
                    format!("retrying ({}/{}): {}", attempt, self.config.retry_times, error.message),
                ));
                drop(registry);
                self.emit(notices).await;
                self.schedule_requeue(job.task_id.clone(), attempt);
                return;
            }

            error!("Task {} failed after {} retries: {}", job.task_id, task.retry_count, error);
            notices.push(Notice::progress(task, error.message.clone()));
            notices.push(Notice::Error {
                task_id: job.task_id.clone(),
                error: error.clone(),
            });
        } else {
            info!("Ignoring failure of {} task {}: {}", task.state, job.task_id, error);
        }

        let leads = registry
            .inflight
            .get(&hash)
            .map(|g| g.leader == job.task_id)
            .unwrap_or(false);
        if leads && should_retry(kind) {
            if let Some(next) = registry.promote(&hash) {
                info!("Task {} takes over from failed task {}", next, job.task_id);
                self.queue_signal.notify_one();
            }
        } else if leads {
            // same bytes, same verdict
            for id in self.take_group(&mut registry, &hash, &job.task_id) {
                let Some(follower) = registry.tasks.get_mut(&id) else {
                    continue;
                };
                if follower.state != TaskState::Pending {
                    continue;
                }
                if advance(follower, TaskState::Processing) && advance(follower, TaskState::Failed) {
                    follower.error = Some(error.clone());
                    notices.push(Notice::progress(follower, error.message.clone()));
                    notices.push(Notice::Error {
                        task_id: id.clone(),
                        error: error.clone(),
                    });
                }
            }
        }

        self.release_files(&registry, &hash, None).await;
        drop(registry);
        self.emit(notices).await;
    }

    fn schedule_requeue(self: &Arc<Self>, task_id: String, attempt: u32) {
        let manager = Arc::clone(self);
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = manager.shutdown.cancelled() => return,
            }
            let mut registry = manager.registry.lock().await;
            let still_waiting = registry
                .tasks
                .get(&task_id)
                .map(|t| t.state == TaskState::Pending && t.retry_count == attempt)
                .unwrap_or(false);
            if still_waiting {
                registry.queue.push_back(task_id);
                drop(registry);
                manager.queue_signal.notify_one();
            }
        });
    }

    /// Cancels a pending or running task. Running workers are left alone; their result is dropped.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let mut registry = self.registry.lock().await;
        let Some(task) = registry.tasks.get_mut(task_id) else {
            return false;
        };
        if !task.state.is_active() {
            return false;
        }
        let was_queued = task.state == TaskState::Pending;
        if !advance(task, TaskState::Cancelled) {
            return false;
        }
        let hash = task.content_hash.clone();
        let notice = Notice::progress(task, "cancelled");

        registry.queue.retain(|id| id != task_id);
        registry.remove_follower(&hash, task_id);
        let leads = registry.inflight.get(&hash).map(|g| g.leader == task_id).unwrap_or(false);
        if leads && was_queued {
            if let Some(next) = registry.promote(&hash) {
                info!("Task {} takes over from cancelled task {}", next, task_id);
                self.queue_signal.notify_one();
            }
        }

        self.release_files(&registry, &hash, None).await;
        drop(registry);
        info!("Task {} cancelled", task_id);
        self.emit(vec![notice]).await;
        true
    }

    /// Drops a pending task whose upload failed and notifies its listeners.
    pub async fn reject_upload(&self, task_id: &str, error: TaskError) -> bool {
        self.reject_upload_with_file(task_id, error, None, true).await
    }

    async fn reject_upload_with_file(&self, task_id: &str, error: TaskError, file: Option<&Path>, notify: bool) -> bool {
        let mut registry = self.registry.lock().await;
        let pending = registry
            .tasks
            .get(task_id)
            .map(|t| t.state == TaskState::Pending)
            .unwrap_or(false);
        if !pending {
            return false;
        }
        let Some(task) = registry.tasks.remove(task_id) else {
            return false;
        };
        registry.queue.retain(|id| id != task_id);
        registry.remove_follower(&task.content_hash, task_id);
        self.release_files(&registry, &task.content_hash, file.or(task.file_path.as_deref()))
            .await;
        drop(registry);

        warn!("Upload for task {} rejected: {}", task_id, error);
        if notify {
            self.emit(vec![Notice::Error {
                task_id: task_id.to_string(),
                error,
            }])
            .await;
        }
        true
    }

    /// Forgets finished tasks past their TTL and pending tasks that never got a file.
    pub async fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let task_ttl = chrono::Duration::seconds(self.config.task_ttl_secs as i64);
        let upload_ttl = chrono::Duration::seconds(self.config.upload_ttl_secs as i64);

        let mut registry = self.registry.lock().await;
        let mut abandoned = Vec::new();
        let expired: Vec<String> = registry
            .tasks
            .values()
            .filter(|t| match t.state {
                TaskState::Pending => t.file_path.is_none() && now - t.created_at > upload_ttl,
                TaskState::Processing => false,
                _ => now - t.completed_at.unwrap_or(t.updated_at) > task_ttl,
            })
            .map(|t| t.id.clone())
            .collect();
        for id in &expired {
            if let Some(task) = registry.tasks.remove(id) {
                if !registry.tasks.values().any(|t| t.content_hash == task.content_hash) {
                    registry.stored.remove(&task.content_hash);
                }
                if task.state == TaskState::Pending {
                    registry.remove_follower(&task.content_hash, id);
                    abandoned.push(Notice::Error {
                        task_id: id.clone(),
                        error: TaskError::new(ErrorKind::UploadAbandoned, "no file received before the upload deadline"),
                    });
                }
            }
        }
        drop(registry);

        if !expired.is_empty() {
            info!("Evicted {} expired tasks", expired.len());
        }
        self.emit(abandoned).await;
        expired.len()
    }

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.registry.lock().await.tasks.get(task_id).cloned()
    }

    pub async fn stats(&self) -> TaskStats {
        let registry = self.registry.lock().await;
        let mut stats = TaskStats {
            queue_depth: registry.queue.len(),
            ..TaskStats::default()
        };
        for task in registry.tasks.values() {
            match task.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Processing => stats.processing += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down task manager");
        self.shutdown.cancel();
        self.queue_signal.notify_waiters();
        self.processor.shutdown().await;
        Ok(())
    }
}

fn render_for(task: &Task, raw: &RawTranscript, meta: TranscriptMeta, merge_gap: f64) -> TranscriptOutput {
    transcript::render(task.output_format, raw, meta, merge_gap)
}
