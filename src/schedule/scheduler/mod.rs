mod task_manager;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cache::CacheGateway;
use crate::error::{ErrorKind, TaskError};
use crate::upload::UploadSessionManager;

pub use task_manager::{should_retry, TaskManager};
use worker::TaskWorker;

pub struct TaskScheduler {
    task_manager: Arc<TaskManager>,
    uploads: Arc<UploadSessionManager>,
    cache: Arc<CacheGateway>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    maintenance_interval: Duration,
    max_cache_days: i64,
}

impl TaskScheduler {
    pub fn new(
        task_manager: Arc<TaskManager>,
        uploads: Arc<UploadSessionManager>,
        cache: Arc<CacheGateway>,
        maintenance_interval: Duration,
        max_cache_days: i64,
    ) -> Self {
        Self {
            task_manager,
            uploads,
            cache,
            workers: Mutex::new(Vec::new()),
            maintenance_interval,
            max_cache_days,
        }
    }

    pub async fn spawn_worker(&self) {
        let mut workers = self.workers.lock().await;
        let worker = TaskWorker::new(self.task_manager.clone(), workers.len());
        workers.push(tokio::spawn(async move {
            worker.run().await;
        }));
    }

    pub async fn spawn_workers(&self, count: usize) {
        for _ in 0..count {
            self.spawn_worker().await;
        }
        info!("Started {} dispatchers", count);
    }

    /// One maintenance pass: abandoned uploads, expired tasks, stale cache entries.
    pub async fn run_maintenance(&self) -> Result<()> {
        for task_id in self.uploads.expire_idle().await {
            self.task_manager
                .reject_upload(
                    &task_id,
                    TaskError::new(ErrorKind::UploadAbandoned, "no chunk received before the idle timeout"),
                )
                .await;
        }
        self.task_manager.evict_expired().await;
        if self.cache.is_enabled() {
            self.cache.purge_older_than(self.max_cache_days).await?;
        }
        Ok(())
    }

    /// Runs maintenance until shutdown, then waits for every dispatcher to stop.
    pub async fn run(&self) -> Result<()> {
        let shutdown = self.task_manager.shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.maintenance_interval) => {
                    if let Err(e) = self.run_maintenance().await {
                        error!("Maintenance pass failed: {}", e);
                    }
                }
            }
        }

        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.await?;
        }
        Ok(())
    }
}
