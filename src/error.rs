use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes shared by the scheduler, the worker pool and the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidAudio,
    AudioTooShort,
    FileNotFound,
    UnsupportedFormat,
    FileTooLarge,
    AuthFailed,
    HashMismatch,
    SizeMismatch,
    UploadAbandoned,
    QueueFull,
    EngineFault,
    Timeout,
    WorkerCrashed,
    WorkerStartup,
    Io,
    Internal,
    Cancelled,
    TaskNotFound,
    SessionNotFound,
    ChunkRejected,
    InvalidMessage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidAudio => "invalid_audio",
            Self::AudioTooShort => "audio_too_short",
            Self::FileNotFound => "file_not_found",
            Self::UnsupportedFormat => "unsupported_format",
            Self::FileTooLarge => "file_too_large",
            Self::AuthFailed => "auth_failed",
            Self::HashMismatch => "hash_mismatch",
            Self::SizeMismatch => "size_mismatch",
            Self::UploadAbandoned => "upload_abandoned",
            Self::QueueFull => "queue_full",
            Self::EngineFault => "engine_fault",
            Self::Timeout => "timeout",
            Self::WorkerCrashed => "worker_crashed",
            Self::WorkerStartup => "worker_startup",
            Self::Io => "io",
            Self::Internal => "internal",
            Self::Cancelled => "cancelled",
            Self::TaskNotFound => "task_not_found",
            Self::SessionNotFound => "session_not_found",
            Self::ChunkRejected => "chunk_rejected",
            Self::InvalidMessage => "invalid_message",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error attached to a task and sent to clients.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{error_type}: {message}")]
pub struct TaskError {
    pub error_type: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(error_type: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    pub fn internal(err: impl Display) -> Self {
        Self::new(ErrorKind::Internal, err.to_string())
    }

    pub fn not_found(task_id: &str) -> Self {
        Self::new(ErrorKind::TaskNotFound, format!("task {} not found", task_id))
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            _ => ErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}
