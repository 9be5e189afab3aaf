use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::cache::CacheStats;
use crate::error::TaskError;
use crate::schedule::{TaskState, TaskStats};
use crate::AppContext;

pub fn schedule_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/tasks/:task_id", get(get_task))
        .route("/tasks/:task_id/status", get(get_task_status))
        .route("/tasks/:task_id/cancel", post(cancel_task))
        .route("/stats", get(get_stats))
        .with_state(ctx)
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub(crate) fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Serialize)]
struct TaskStatusView {
    task_id: String,
    status: TaskState,
    progress: u8,
    retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<TaskError>,
}

#[derive(Debug, Serialize)]
struct StatsView {
    tasks: TaskStats,
    cache: Option<CacheStats>,
    upload_sessions: usize,
    hub_listeners: usize,
}

async fn get_task(State(ctx): State<Arc<AppContext>>, Path(task_id): Path<String>) -> impl IntoResponse {
    match ctx.task_manager.get_task(&task_id).await {
        Some(task) => (StatusCode::OK, Json(ApiResponse::success(task))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Task not found".to_string())),
        ),
    }
}

async fn get_task_status(State(ctx): State<Arc<AppContext>>, Path(task_id): Path<String>) -> impl IntoResponse {
    match ctx.task_manager.get_task(&task_id).await {
        Some(task) => (
            StatusCode::OK,
            Json(ApiResponse::success(TaskStatusView {
                task_id: task.id,
                status: task.state,
                progress: task.progress,
                retry_count: task.retry_count,
                error: task.error,
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Task not found".to_string())),
        ),
    }
}

async fn cancel_task(State(ctx): State<Arc<AppContext>>, Path(task_id): Path<String>) -> impl IntoResponse {
    if ctx.task_manager.cancel(&task_id).await {
        ctx.uploads.abort(&task_id).await;
        info!("Task {} cancelled over HTTP", task_id);
        return (StatusCode::OK, Json(ApiResponse::success(())));
    }
    match ctx.task_manager.get_task(&task_id).await {
        Some(task) => (
            StatusCode::CONFLICT,
            Json(ApiResponse::error(format!("Task is already {}", task.state))),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Task not found".to_string())),
        ),
    }
}

async fn get_stats(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let cache = if ctx.cache.is_enabled() {
        match ctx.cache.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                error!("Failed to read cache stats: {}", e);
                None
            }
        }
    } else {
        None
    };
    let view = StatsView {
        tasks: ctx.task_manager.stats().await,
        cache,
        upload_sessions: ctx.uploads.active_sessions().await,
        hub_listeners: ctx.hub.listeners().await,
    };
    (StatusCode::OK, Json(ApiResponse::success(view)))
}
