use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::pool::PoolError;
use crate::schedule::types::{Job, JobOutput};

/// Progress percentages reported while a job runs.
pub type ProgressSender = UnboundedSender<u8>;

#[derive(Debug, Clone)]
pub struct JobFailure {
    /// Slot the job ran on, when it got that far.
    pub slot: Option<usize>,
    pub error: PoolError,
}

impl JobFailure {
    pub fn new(slot: Option<usize>, error: PoolError) -> Self {
        Self { slot, error }
    }
}

/// Executes jobs out of process. The task manager owns retries; a processor only reports
/// what happened and recycles slots on request.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, job: &Job, progress: ProgressSender) -> Result<JobOutput, JobFailure>;
    async fn recycle(&self, slot: usize);
    fn concurrency(&self) -> usize;
    async fn shutdown(&self);
}
