//! Bounded pool of recycled worker processes driven through file IPC.

use thiserror::Error;

use crate::error::{ErrorKind, TaskError};

pub mod file_pool;
pub mod ipc;
pub mod slot;
pub mod worker_loop;

pub use file_pool::{compute_timeout, FileBasedPool};
pub use slot::WorkerCommand;

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("worker {slot} failed to start: {message}")]
    Startup { slot: usize, message: String },
    #[error("worker {slot} crashed again while running {task_id}")]
    WorkerCrashed { slot: usize, task_id: String },
    #[error("task {task_id} produced no result within {seconds}s")]
    Timeout { task_id: String, seconds: u64 },
    #[error("{0}")]
    Engine(TaskError),
    #[error("ipc failure: {0}")]
    Ipc(String),
    #[error("pool is shutting down")]
    ShuttingDown,
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Startup { .. } => ErrorKind::WorkerStartup,
            Self::WorkerCrashed { .. } => ErrorKind::WorkerCrashed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Engine(e) => e.error_type,
            Self::Ipc(_) => ErrorKind::Io,
            Self::ShuttingDown => ErrorKind::Cancelled,
        }
    }

    pub fn to_task_error(&self) -> TaskError {
        match self {
            Self::Engine(e) => e.clone(),
            other => TaskError::new(other.kind(), other.to_string()),
        }
    }
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        Self::Ipc(err.to_string())
    }
}

impl From<anyhow::Error> for PoolError {
    fn from(err: anyhow::Error) -> Self {
        Self::Ipc(err.to_string())
    }
}
