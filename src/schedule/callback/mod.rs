use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::config::NotificationConfig;
use crate::error::TaskError;
use crate::schedule::types::TaskState;
use crate::transcript::TranscriptOutput;
use crate::utils::http::{post_json_with_retry, RetryPolicy};

/// Receives task lifecycle notifications. Delivery failures are logged by the caller and
/// never affect task state.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn on_progress(&self, task_id: &str, percent: u8, status: TaskState, message: &str) -> Result<()>;
    async fn on_complete(&self, task_id: &str, result: &TranscriptOutput) -> Result<()>;
    async fn on_error(&self, task_id: &str, error: &TaskError) -> Result<()>;
}

// HTTP 回调实现
/// Posts lifecycle notifications to a webhook. Payloads are queued and a background task
/// delivers them in order, so a slow or unreachable endpoint never holds up dispatch.
pub struct WebhookSink {
    outbox: mpsc::UnboundedSender<Delivery>,
}

struct Delivery {
    task_id: String,
    body: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct CallbackPayload<'a, T: Serialize> {
    task_id: &'a str,
    status: TaskState,
    data: T,
}

#[derive(Debug, Serialize)]
struct ProgressData<'a> {
    progress: u8,
    message: &'a str,
}

impl WebhookSink {
    /// Must be called inside a tokio runtime; the delivery task lives as long as the sink.
    pub fn new(url: String, config: &NotificationConfig) -> Self {
        let policy = RetryPolicy {
            attempts: config.retry_times,
            timeout: std::time::Duration::from_secs(config.timeout_secs),
            backoff_base: std::time::Duration::from_millis(config.backoff_base_ms),
        };
        let (outbox, inbox) = mpsc::unbounded_channel();
        tokio::spawn(deliver(reqwest::Client::new(), url, policy, inbox));
        Self { outbox }
    }

    fn enqueue<T: Serialize>(&self, payload: CallbackPayload<'_, T>) -> Result<()> {
        let body = serde_json::to_value(&payload)?;
        self.outbox
            .send(Delivery {
                task_id: payload.task_id.to_string(),
                body,
            })
            .map_err(|_| anyhow::anyhow!("webhook delivery task has stopped"))
    }
}

async fn deliver(
    client: reqwest::Client,
    url: String,
    policy: RetryPolicy,
    mut inbox: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = inbox.recv().await {
        if let Err(e) = post_json_with_retry(&client, &url, &delivery.body, &policy).await {
            warn!("Dropping webhook notification for {}: {}", delivery.task_id, e);
        }
    }
    debug!("Webhook delivery to {} stopped", url);
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn on_progress(&self, task_id: &str, percent: u8, status: TaskState, message: &str) -> Result<()> {
        // only lifecycle edges are posted, intermediate percentages stay local
        if status == TaskState::Processing && percent != 0 {
            return Ok(());
        }
        self.enqueue(CallbackPayload {
            task_id,
            status,
            data: ProgressData {
                progress: percent,
                message,
            },
        })
    }

    async fn on_complete(&self, task_id: &str, result: &TranscriptOutput) -> Result<()> {
        self.enqueue(CallbackPayload {
            task_id,
            status: TaskState::Completed,
            data: result,
        })
    }

    async fn on_error(&self, task_id: &str, error: &TaskError) -> Result<()> {
        self.enqueue(CallbackPayload {
            task_id,
            status: TaskState::Failed,
            data: error,
        })
    }
}

// 内部事件回调实现
#[derive(Clone)]
pub struct EventSink {
    pub sender: broadcast::Sender<TaskEvent>,
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Progress {
        task_id: String,
        progress: u8,
        status: TaskState,
        message: String,
    },
    Completed {
        task_id: String,
        result: TranscriptOutput,
    },
    Failed {
        task_id: String,
        error: TaskError,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Progress { task_id, .. } | Self::Completed { task_id, .. } | Self::Failed { task_id, .. } => task_id,
        }
    }
}

impl EventSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<TaskEvent>) {
        let (sender, receiver) = broadcast::channel(capacity);
        (Self { sender }, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: TaskEvent) {
        // no subscribers is not an error
        let _ = self.sender.send(event);
    }
}

#[async_trait]
impl NotificationSink for EventSink {
    async fn on_progress(&self, task_id: &str, percent: u8, status: TaskState, message: &str) -> Result<()> {
        self.publish(TaskEvent::Progress {
            task_id: task_id.to_string(),
            progress: percent,
            status,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn on_complete(&self, task_id: &str, result: &TranscriptOutput) -> Result<()> {
        self.publish(TaskEvent::Completed {
            task_id: task_id.to_string(),
            result: result.clone(),
        });
        Ok(())
    }

    async fn on_error(&self, task_id: &str, error: &TaskError) -> Result<()> {
        self.publish(TaskEvent::Failed {
            task_id: task_id.to_string(),
            error: error.clone(),
        });
        Ok(())
    }
}

/// Forwards every notification to each inner sink; one failing sink does not stop the rest.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    async fn on_progress(&self, task_id: &str, percent: u8, status: TaskState, message: &str) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.on_progress(task_id, percent, status, message).await {
                warn!("Progress notification for {} failed: {}", task_id, e);
            }
        }
        Ok(())
    }

    async fn on_complete(&self, task_id: &str, result: &TranscriptOutput) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.on_complete(task_id, result).await {
                warn!("Completion notification for {} failed: {}", task_id, e);
            }
        }
        Ok(())
    }

    async fn on_error(&self, task_id: &str, error: &TaskError) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.on_error(task_id, error).await {
                warn!("Error notification for {} failed: {}", task_id, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct Failing;

    #[async_trait]
    impl NotificationSink for Failing {
        async fn on_progress(&self, _: &str, _: u8, _: TaskState, _: &str) -> Result<()> {
            anyhow::bail!("down")
        }

        async fn on_complete(&self, _: &str, _: &TranscriptOutput) -> Result<()> {
            anyhow::bail!("down")
        }

        async fn on_error(&self, _: &str, _: &TaskError) -> Result<()> {
            anyhow::bail!("down")
        }
    }

    #[tokio::test]
    async fn test_fanout_continues_past_failing_sink() {
        let (events, mut rx) = EventSink::new(8);
        let fanout = FanoutSink::new(vec![Arc::new(Failing), Arc::new(events)]);

        fanout.on_progress("task-1", 40, TaskState::Processing, "running").await.unwrap();
        fanout
            .on_error("task-1", &TaskError::new(ErrorKind::Timeout, "slow"))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            TaskEvent::Progress { progress, .. } => assert_eq!(progress, 40),
            other => panic!("unexpected {:?}", other),
        }
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.task_id(), "task-1");
        assert!(matches!(failed, TaskEvent::Failed { error, .. } if error.error_type == ErrorKind::Timeout));
    }

    fn notification_config(url: &str, timeout_secs: u64) -> NotificationConfig {
        NotificationConfig {
            webhook_url: Some(url.to_string()),
            retry_times: 3,
            timeout_secs,
            backoff_base_ms: 50,
        }
    }

    async fn collecting_endpoint() -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = axum::Router::new().route(
            "/hook",
            axum::routing::post(move |axum::Json(body): axum::Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body);
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/hook", addr), rx)
    }

    #[tokio::test]
    async fn test_webhook_delivers_lifecycle_edges_in_order() {
        let (url, mut received) = collecting_endpoint().await;
        let sink = WebhookSink::new(url.clone(), &notification_config(&url, 5));

        sink.on_progress("task-1", 0, TaskState::Pending, "queued").await.unwrap();
        sink.on_progress("task-1", 40, TaskState::Processing, "transcribing").await.unwrap();
        sink.on_complete("task-1", &TranscriptOutput::Srt("1\n".into())).await.unwrap();

        let wait = std::time::Duration::from_secs(10);
        let first = tokio::time::timeout(wait, received.recv()).await.unwrap().unwrap();
        assert_eq!(first["task_id"], "task-1");
        assert_eq!(first["status"], "pending");
        assert_eq!(first["data"]["progress"], 0);
        let second = tokio::time::timeout(wait, received.recv()).await.unwrap().unwrap();
        assert_eq!(second["status"], "completed");
        assert_eq!(second["data"]["format"], "srt");
    }

    #[tokio::test]
    async fn test_unresponsive_webhook_does_not_block_the_caller() {
        // accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let url = format!("http://{}/hook", addr);
        let sink = WebhookSink::new(url.clone(), &notification_config(&url, 30));

        let quick = std::time::Duration::from_millis(200);
        let sent = tokio::time::timeout(quick, async {
            sink.on_progress("task-1", 0, TaskState::Pending, "queued").await?;
            sink.on_complete("task-1", &TranscriptOutput::Srt(String::new())).await?;
            sink.on_error("task-2", &TaskError::new(ErrorKind::Timeout, "slow")).await
        })
        .await;
        assert!(matches!(sent, Ok(Ok(()))), "notifications blocked on the endpoint: {:?}", sent);
    }

    #[tokio::test]
    async fn test_event_sink_without_subscribers_is_ok() {
        let (events, rx) = EventSink::new(1);
        drop(rx);
        assert!(events.on_progress("t", 0, TaskState::Pending, "").await.is_ok());
    }
}
