//! Background unit of work: claim a task, extract, store the outcome.
//!
//! A failed extraction still completes the task, with `{}` as its result,
//! so a poll never sees a third status. The failure text is kept in the
//! task's `error` column for operators.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::extractor::Extractor;
use crate::store::{Claim, StoreError, TaskStore};

/// What a single processing run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// The extractor succeeded and its result was stored.
    Completed,
    /// The extractor failed; `{}` was stored.
    Failed,
    /// No such task.
    Missing,
    /// Already finished, or another worker holds it.
    Skipped,
}

pub struct TaskProcessor {
    store: Arc<dyn TaskStore>,
    extractor: Arc<dyn Extractor>,
    timeout: Duration,
}

impl TaskProcessor {
    pub fn new(store: Arc<dyn TaskStore>, extractor: Arc<dyn Extractor>, timeout: Duration) -> Self {
        Self {
            store,
            extractor,
            timeout,
        }
    }

    /// Fire-and-forget entry point. Never fails; everything is logged.
    pub async fn process(&self, task_id: &str) {
        match self.run(task_id).await {
            Ok(outcome) => debug!(task_id, ?outcome, "processing finished"),
            Err(StoreError::NotFound(_)) => {
                warn!(task_id, "task disappeared before its result was saved");
            }
            Err(e) => {
                // The task stays "processing" until the next startup reclaims it.
                error!(task_id, error = %e, "storage failure while processing task");
            }
        }
    }

    /// Same as [`process`](Self::process) but reports what happened.
    pub async fn run(&self, task_id: &str) -> Result<Processed, StoreError> {
        let task = match self.store.claim(task_id).await? {
            Claim::Acquired(task) => task,
            Claim::Missing => {
                warn!(task_id, "task not found");
                return Ok(Processed::Missing);
            }
            Claim::Finished => {
                debug!(task_id, "task already completed, skipping");
                return Ok(Processed::Skipped);
            }
            Claim::InProgress => {
                debug!(task_id, "task claimed by another worker, skipping");
                return Ok(Processed::Skipped);
            }
        };

        match self.extract(task.image_data).await {
            Ok(result) => {
                self.store.save_result(task_id, &result, None).await?;
                info!(task_id, extractor = self.extractor.name(), "task processed successfully");
                Ok(Processed::Completed)
            }
            Err(e) => {
                let detail = format!("{e:#}");
                error!(task_id, extractor = self.extractor.name(), error = %detail, "extraction failed");
                self.store
                    .save_result(task_id, &json!({}), Some(&detail))
                    .await?;
                Ok(Processed::Failed)
            }
        }
    }

    /// Runs the extractor on its own task; a panic there is a failure
    /// like any other.
    async fn extract(&self, image: Vec<u8>) -> anyhow::Result<Value> {
        let extractor = Arc::clone(&self.extractor);
        let mut handle = tokio::spawn(async move { extractor.extract(&image).await });

        let joined = match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                anyhow::bail!(
                    "extraction timed out after {}s",
                    self.timeout.as_secs_f64()
                );
            }
        };

        match joined {
            Ok(Ok(value)) if !value.is_object() => Err(anyhow::anyhow!(
                "{} returned a non-object result",
                self.extractor.name()
            )),
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow::anyhow!(
                "{} panicked: {}",
                self.extractor.name(),
                panic_message(e.into_panic())
            )),
            Err(e) => Err(anyhow::anyhow!("extraction task failed: {e}")),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
