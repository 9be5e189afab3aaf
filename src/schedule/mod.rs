pub mod callback;
pub mod processors;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod tests;

pub use callback::{EventSink, FanoutSink, NotificationSink, TaskEvent, WebhookSink};
pub use processors::{JobFailure, ProgressSender, TaskProcessor};
pub use scheduler::{should_retry, TaskManager, TaskScheduler};
pub use types::{
    FinalizeOutcome, Job, JobOutput, QueueInfo, SubmitOutcome, SubmitRequest, Task, TaskState, TaskStats,
};
