//! WebSocket protocol: JSON envelopes `{type, data, timestamp}` in both directions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, TaskError};
use crate::schedule::{FinalizeOutcome, NotificationSink, QueueInfo, SubmitOutcome, SubmitRequest, TaskState};
use crate::transcript::{OutputFormat, TranscriptOutput};
use crate::upload::validate::negotiate_chunk_size;
use crate::upload::{ChunkAck, ChunkStatus, ResumeInfo, SessionMeta, UploadError};
use crate::AppContext;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    Single,
    #[default]
    Chunked,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    UploadRequest {
        file_name: String,
        file_size: u64,
        file_hash: String,
        #[serde(default)]
        force_refresh: bool,
        #[serde(default)]
        output_format: OutputFormat,
        #[serde(default)]
        upload_mode: UploadMode,
        #[serde(default)]
        chunk_size: Option<u64>,
    },
    UploadChunk {
        task_id: String,
        chunk_index: u64,
        #[serde(default)]
        chunk_hash: Option<String>,
        /// base64
        data: String,
    },
    UploadData {
        task_id: String,
        /// base64
        file_data: String,
    },
    UploadResume {
        task_id: String,
    },
    TaskStatus {
        task_id: String,
    },
    CancelTask {
        task_id: String,
    },
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadOutcome {
    Queued,
    Joined,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    UploadReady {
        task_id: String,
        upload_mode: UploadMode,
        chunk_size: u64,
        total_chunks: u64,
    },
    ChunkReceived(ChunkAck),
    UploadProgress(ResumeInfo),
    UploadComplete {
        task_id: String,
        status: UploadOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        queue: Option<QueueInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        leader_id: Option<String>,
    },
    TaskProgress {
        task_id: String,
        progress: u8,
        status: TaskState,
        message: String,
    },
    TaskComplete {
        task_id: String,
        result: TranscriptOutput,
    },
    TaskStatus {
        task_id: String,
        status: TaskState,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<TranscriptOutput>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<TaskError>,
    },
    TaskCancelled {
        task_id: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        error_type: ErrorKind,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(task_id: Option<&str>, error: &TaskError) -> Self {
        Self::Error {
            task_id: task_id.map(str::to_string),
            error_type: error.error_type,
            message: error.message.clone(),
        }
    }

    /// JSON text with the send time added to the envelope.
    pub fn encode(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(envelope) = value.as_object_mut() {
            envelope.insert("timestamp".into(), serde_json::Value::String(Utc::now().to_rfc3339()));
        }
        Ok(serde_json::to_string(&value)?)
    }
}

pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Routes task notifications to the connection that created the task.
#[derive(Default)]
pub struct ConnectionHub {
    listeners: RwLock<HashMap<String, Outbox>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, task_id: &str, outbox: Outbox) {
        self.listeners.write().await.insert(task_id.to_string(), outbox);
    }

    /// Forgets every task registered by the connection behind `outbox`.
    pub async fn unregister(&self, outbox: &Outbox) {
        self.listeners.write().await.retain(|_, tx| !tx.same_channel(outbox));
    }

    pub async fn listeners(&self) -> usize {
        self.listeners.read().await.len()
    }

    async fn deliver(&self, task_id: &str, message: ServerMessage) {
        let listeners = self.listeners.read().await;
        if let Some(tx) = listeners.get(task_id) {
            if tx.send(message).is_err() {
                debug!("Listener for {} is gone", task_id);
            }
        }
    }
}

#[async_trait]
impl NotificationSink for ConnectionHub {
    async fn on_progress(&self, task_id: &str, percent: u8, status: TaskState, message: &str) -> Result<()> {
        self.deliver(
            task_id,
            ServerMessage::TaskProgress {
                task_id: task_id.to_string(),
                progress: percent,
                status,
                message: message.to_string(),
            },
        )
        .await;
        Ok(())
    }

    async fn on_complete(&self, task_id: &str, result: &TranscriptOutput) -> Result<()> {
        self.deliver(
            task_id,
            ServerMessage::TaskComplete {
                task_id: task_id.to_string(),
                result: result.clone(),
            },
        )
        .await;
        Ok(())
    }

    async fn on_error(&self, task_id: &str, error: &TaskError) -> Result<()> {
        self.deliver(task_id, ServerMessage::error(Some(task_id), error)).await;
        Ok(())
    }
}

/// Protocol state of one client connection, independent of the socket carrying it.
pub struct Connection {
    ctx: Arc<AppContext>,
    outbox: Outbox,
}

impl Connection {
    pub fn new(ctx: Arc<AppContext>) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        (Self { ctx, outbox }, inbox)
    }

    fn send(&self, message: ServerMessage) {
        // the receiver only goes away with the socket
        let _ = self.outbox.send(message);
    }

    fn fail(&self, task_id: Option<&str>, error: &TaskError) {
        warn!("Client request failed{}: {}", task_id.map(|t| format!(" for {}", t)).unwrap_or_default(), error);
        self.send(ServerMessage::error(task_id, error));
    }

    pub async fn handle_text(&self, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                self.fail(None, &TaskError::new(ErrorKind::InvalidMessage, format!("invalid message: {}", e)));
                return;
            }
        };

        match message {
            ClientMessage::UploadRequest {
                file_name,
                file_size,
                file_hash,
                force_refresh,
                output_format,
                upload_mode,
                chunk_size,
            } => {
                let request = SubmitRequest {
                    file_name,
                    file_size,
                    content_hash: file_hash,
                    output_format,
                    force_refresh,
                };
                self.upload_request(request, upload_mode, chunk_size).await
            }
            ClientMessage::UploadChunk {
                task_id,
                chunk_index,
                chunk_hash,
                data,
            } => self.upload_chunk(&task_id, chunk_index, chunk_hash.as_deref(), &data).await,
            ClientMessage::UploadData { task_id, file_data } => self.upload_data(&task_id, &file_data).await,
            ClientMessage::UploadResume { task_id } => match self.ctx.uploads.resume_info(&task_id).await {
                Ok(info) => self.send(ServerMessage::UploadProgress(info)),
                Err(e) => self.fail(Some(&task_id), &e.to_task_error()),
            },
            ClientMessage::TaskStatus { task_id } => match self.ctx.task_manager.get_task(&task_id).await {
                Some(task) => self.send(ServerMessage::TaskStatus {
                    task_id: task.id,
                    status: task.state,
                    progress: task.progress,
                    result: task.result,
                    error: task.error,
                }),
                None => self.fail(Some(&task_id), &TaskError::not_found(&task_id)),
            },
            ClientMessage::CancelTask { task_id } => {
                if self.ctx.task_manager.cancel(&task_id).await {
                    self.ctx.uploads.abort(&task_id).await;
                    self.send(ServerMessage::TaskCancelled { task_id });
                } else {
                    let error = match self.ctx.task_manager.get_task(&task_id).await {
                        Some(task) => TaskError::new(
                            ErrorKind::InvalidMessage,
                            format!("task {} is already {}", task_id, task.state),
                        ),
                        None => TaskError::not_found(&task_id),
                    };
                    self.fail(Some(&task_id), &error);
                }
            }
            ClientMessage::Ping => self.send(ServerMessage::Pong),
        }
    }

    async fn upload_request(&self, request: SubmitRequest, mode: UploadMode, chunk_size: Option<u64>) {
        let file_name = request.file_name.clone();
        let task = match self.ctx.task_manager.submit(request).await {
            Ok(SubmitOutcome::Cached(task)) => {
                if let Some(result) = task.result {
                    self.send(ServerMessage::TaskComplete { task_id: task.id, result });
                }
                return;
            }
            Ok(SubmitOutcome::Accepted(task)) => task,
            Err(e) => {
                self.fail(None, &e);
                return;
            }
        };
        self.ctx.hub.register(&task.id, self.outbox.clone()).await;

        let (chunk_size, total_chunks) = match mode {
            UploadMode::Single => (task.file_size, 1),
            UploadMode::Chunked => {
                let meta = SessionMeta {
                    task_id: task.id.clone(),
                    file_name,
                    file_size: task.file_size,
                    file_hash: task.content_hash.clone(),
                    chunk_size: negotiate_chunk_size(chunk_size, &self.ctx.config.transcription),
                };
                match self.ctx.uploads.open(meta).await {
                    Ok(info) => (info.chunk_size, info.total_chunks),
                    Err(e) => {
                        error!("Cannot open upload session for {}: {}", task.id, e);
                        let error = e.to_task_error();
                        if !self.ctx.task_manager.reject_upload(&task.id, error.clone()).await {
                            self.fail(Some(&task.id), &error);
                        }
                        return;
                    }
                }
            }
        };
        self.send(ServerMessage::UploadReady {
            task_id: task.id,
            upload_mode: mode,
            chunk_size,
            total_chunks,
        });
    }

    async fn upload_chunk(&self, task_id: &str, index: u64, chunk_hash: Option<&str>, data: &str) {
        let bytes = match BASE64.decode(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                let error = TaskError::new(ErrorKind::ChunkRejected, format!("chunk {} is not base64: {}", index, e));
                self.fail(Some(task_id), &error);
                return;
            }
        };

        let ack = match self.ctx.uploads.put_chunk(task_id, index, &bytes, chunk_hash).await {
            Ok(ack) => ack,
            Err(e) => {
                self.fail(Some(task_id), &e.to_task_error());
                return;
            }
        };
        let finished = ack.complete && ack.status == ChunkStatus::Received;
        self.send(ServerMessage::ChunkReceived(ack));

        if finished {
            match self.ctx.uploads.finalize(task_id).await {
                Ok(path) => self.hand_off(task_id, path).await,
                Err(e) => self.reject(task_id, e).await,
            }
        }
    }

    async fn upload_data(&self, task_id: &str, file_data: &str) {
        let Some(task) = self.ctx.task_manager.get_task(task_id).await else {
            self.fail(Some(task_id), &TaskError::not_found(task_id));
            return;
        };
        let bytes = match BASE64.decode(file_data) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(Some(task_id), &TaskError::new(ErrorKind::InvalidMessage, e.to_string()));
                return;
            }
        };
        match self
            .ctx
            .uploads
            .save_single(task_id, &task.file_name, task.file_size, &task.content_hash, &bytes)
            .await
        {
            Ok(path) => self.hand_off(task_id, path).await,
            Err(e) => self.reject(task_id, e).await,
        }
    }

    async fn hand_off(&self, task_id: &str, path: PathBuf) {
        let message = match self.ctx.task_manager.finalize_upload(task_id, path).await {
            Ok(FinalizeOutcome::Queued { queue, .. }) => ServerMessage::UploadComplete {
                task_id: task_id.to_string(),
                status: UploadOutcome::Queued,
                queue: Some(queue),
                leader_id: None,
            },
            Ok(FinalizeOutcome::Joined { leader_id, .. }) => ServerMessage::UploadComplete {
                task_id: task_id.to_string(),
                status: UploadOutcome::Joined,
                queue: None,
                leader_id: Some(leader_id),
            },
            Ok(FinalizeOutcome::Cached(_)) => ServerMessage::UploadComplete {
                task_id: task_id.to_string(),
                status: UploadOutcome::Completed,
                queue: None,
                leader_id: None,
            },
            Err(e) => {
                self.fail(Some(task_id), &e);
                return;
            }
        };
        self.send(message);
    }

    /// Ends an upload for good. Listeners hear about it through the task manager.
    async fn reject(&self, task_id: &str, error: UploadError) {
        let task_error = error.to_task_error();
        if !error.is_terminal() {
            self.fail(Some(task_id), &task_error);
            return;
        }
        if !self.ctx.task_manager.reject_upload(task_id, task_error.clone()).await {
            self.fail(Some(task_id), &task_error);
        }
    }

    pub async fn close(&self) {
        self.ctx.hub.unregister(&self.outbox).await;
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let limit = ctx.config.transcription.max_chunk_size as usize * 2 + 64 * 1024;
    ws.max_message_size(limit).on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: Arc<AppContext>) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut inbox) = Connection::new(ctx);
    info!("Client connected");

    let forward_task = tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(text)).await {
                error!("Failed to forward message to WebSocket: {}", e);
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => connection.handle_text(&text).await,
            Ok(Message::Binary(data)) => {
                debug!("Ignoring {} byte binary frame", data.len());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error: {}", e);
                break;
            }
        }
    }

    connection.close().await;
    forward_task.abort();
    info!("Client disconnected");
}
