use std::fmt::Display;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::asr::{RawTranscript, TranscribeParams};
use crate::error::TaskError;
use crate::transcript::{OutputFormat, TranscriptOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Edges of the task lifecycle. `Pending -> Completed` is only taken for cache hits
    /// and results shared from an identical run.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Pending)
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Processing => "processing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub file_name: String,
    pub file_size: u64,
    pub content_hash: String,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub file_name: String,
    pub file_path: Option<PathBuf>,
    pub file_size: u64,
    pub content_hash: String,
    pub output_format: OutputFormat,
    pub force_refresh: bool,
    pub state: TaskState,
    pub progress: u8,
    pub retry_count: u32,
    pub result: Option<TranscriptOutput>,
    pub error: Option<TaskError>,
    pub duration_seconds: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(request: SubmitRequest) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task-{}", Uuid::new_v4()),
            file_name: request.file_name,
            file_path: None,
            file_size: request.file_size,
            content_hash: request.content_hash.to_ascii_lowercase(),
            output_format: request.output_format,
            force_refresh: request.force_refresh,
            state: TaskState::Pending,
            progress: 0,
            retry_count: 0,
            result: None,
            error: None,
            duration_seconds: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Applies a lifecycle edge, refusing anything outside the graph.
    pub fn transition(&mut self, next: TaskState) -> Result<(), TaskError> {
        if !self.state.can_transition_to(next) {
            return Err(TaskError::internal(format!(
                "task {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        let now = Utc::now();
        self.state = next;
        self.updated_at = now;
        match next {
            TaskState::Processing => self.started_at = Some(now),
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled => self.completed_at = Some(now),
            TaskState::Pending => self.completed_at = None,
        }
        Ok(())
    }

    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

/// Where a task stands in the dispatch queue right after upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub position: usize,
    pub queue_depth: usize,
    pub estimated_wait_minutes: f64,
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Accepted(Task),
    Cached(Task),
}

#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    Queued { task: Task, queue: QueueInfo },
    Cached(Task),
    /// An identical upload is already queued or running; this task completes with its result.
    Joined { task: Task, leader_id: String },
}

/// One dispatch of a task onto the worker pool.
#[derive(Debug, Clone)]
pub struct Job {
    pub task_id: String,
    pub attempt: u32,
    pub audio_path: PathBuf,
    pub duration_seconds: f64,
    /// Expected wall time, used for progress estimates only.
    pub expected_seconds: f64,
    pub params: TranscribeParams,
}

impl Job {
    /// Name used in IPC file names; unique per attempt.
    pub fn ipc_id(&self) -> String {
        format!("{}_{}", self.task_id, self.attempt)
    }
}

#[derive(Debug, Clone)]
pub struct JobOutput {
    pub raw: RawTranscript,
    pub slot: usize,
    pub worker_pid: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queue_depth: usize,
}
