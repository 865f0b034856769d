//! HTTP surface: upload a receipt, poll for its extraction.
//!
//! - `POST /create_task` (multipart, field `file`) → `{"task_id"}`
//! - `GET /get_task/{task_id}` → `{"task_id", "status", "extracted_json"?}`
//! - `GET /health`

pub mod error;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::consts::VERSION;
use crate::dispatch::Dispatcher;
use crate::store::{TaskStatus, TaskStore};

pub use error::ApiError;

const FILE_FIELD: &str = "file";

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub dispatcher: Dispatcher,
}

#[derive(Debug, Serialize)]
pub struct CreatedTask {
    pub task_id: String,
}

#[derive(Debug, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_json: Option<Value>,
}

/// Build the application router.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/create_task", post(create_task))
        .route("/get_task/{task_id}", get(get_task))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Store the upload, schedule extraction, and answer before it runs.
async fn create_task(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<CreatedTask>, ApiError> {
    let image = read_file_field(&mut multipart).await?;
    let size = image.len();

    let task_id = state.store.create(image).await?;
    state.dispatcher.dispatch(task_id.clone());

    info!(task_id = %task_id, bytes = size, "task created");
    Ok(Json(CreatedTask { task_id }))
}

async fn read_file_field(multipart: &mut Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let bytes = field.bytes().await?;
        if bytes.is_empty() {
            return Err(ApiError::BadRequest("uploaded file is empty".to_owned()));
        }
        return Ok(bytes.to_vec());
    }
    Err(ApiError::BadRequest(format!(
        "missing multipart field '{FILE_FIELD}'"
    )))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let task = state
        .store
        .get(&task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Task not found".to_owned()))?;

    Ok(Json(TaskView {
        status: task.status(),
        task_id: task.task_id,
        extracted_json: task.extracted_json,
    }))
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok", "version": VERSION }))
}
