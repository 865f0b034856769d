pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// One uploaded receipt, awaiting or holding its extraction result.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    pub image_data: Vec<u8>,
    /// `None` while processing. `Some({})` after a failed extraction.
    pub extracted_json: Option<Value>,
    /// Why extraction failed, if it did. Never shown to API clients.
    pub error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Status is derived, not stored.
    pub fn status(&self) -> TaskStatus {
        if self.extracted_json.is_some() {
            TaskStatus::Completed
        } else {
            TaskStatus::Processing
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Processing,
    Completed,
}

/// Result of trying to take ownership of a task before processing it.
#[derive(Debug)]
pub enum Claim {
    /// The caller now owns the task and must store a result for it.
    Acquired(Task),
    /// Another worker holds the claim.
    InProgress,
    /// A result is already stored.
    Finished,
    Missing,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database connection lock poisoned")]
    Poisoned,

    #[error("database worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Durable task persistence. Every call commits before returning.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task with no result and return its fresh identifier.
    async fn create(&self, image_data: Vec<u8>) -> Result<String, StoreError>;

    async fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    /// Mark the task as owned by the caller unless it is missing, finished
    /// or already claimed.
    async fn claim(&self, task_id: &str) -> Result<Claim, StoreError>;

    /// Attach a result (or `{}` plus an error on failure). Fails with
    /// [`StoreError::NotFound`] if the task no longer exists.
    async fn save_result(
        &self,
        task_id: &str,
        result: &Value,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Release claims left behind by a previous process and return the ids
    /// of every task still without a result, oldest first.
    async fn reclaim_unfinished(&self) -> Result<Vec<String>, StoreError>;
}
