use std::sync::Arc;

use anyhow::Result;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

use super::TaskManager;

/// One dispatch loop. The scheduler runs as many of these as the pool has slots.
pub struct TaskWorker {
    task_manager: Arc<TaskManager>,
    // worker index, for logs only
    id: usize,
}

impl TaskWorker {
    pub fn new(task_manager: Arc<TaskManager>, id: usize) -> Self {
        Self { task_manager, id }
    }

    pub async fn run(&self) {
        loop {
            match self.process_next_task().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    error!("Dispatcher {} error: {}", self.id, e);
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
        info!("Dispatcher {} stopped", self.id);
    }

    /// Returns `false` once the task manager is shutting down.
    async fn process_next_task(&self) -> Result<bool> {
        let Some(job) = self.task_manager.next_job().await else {
            return Ok(false);
        };
        info!("Dispatcher {} processing task {} (attempt {})", self.id, job.task_id, job.attempt + 1);
        self.task_manager.process_job(job).await;
        Ok(true)
    }
}
