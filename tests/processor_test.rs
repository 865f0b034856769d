use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use tally::dispatch::Dispatcher;
use tally::extractor::Extractor;
use tally::extractor::mock::{MockExtractor, MockReply};
use tally::processor::{Processed, TaskProcessor};
use tally::store::sqlite::SqliteTaskStore;
use tally::store::{TaskStatus, TaskStore};

fn build(extractor: Arc<dyn Extractor>) -> (Arc<SqliteTaskStore>, TaskProcessor) {
    let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
    let processor = TaskProcessor::new(store.clone(), extractor, Duration::from_secs(5));
    (store, processor)
}

/// Never answers.
struct HangingExtractor;

#[async_trait]
impl Extractor for HangingExtractor {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn extract(&self, _image: &[u8]) -> Result<Value> {
        std::future::pending().await
    }
}

/// Panics on every call.
struct PanickingExtractor;

#[async_trait]
impl Extractor for PanickingExtractor {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn extract(&self, _image: &[u8]) -> Result<Value> {
        panic!("decoder blew up");
    }
}

/// Records the bytes it was given.
struct EchoExtractor;

#[async_trait]
impl Extractor for EchoExtractor {
    fn name(&self) -> &str {
        "echo"
    }

    async fn extract(&self, image: &[u8]) -> Result<Value> {
        Ok(json!({ "bytes": String::from_utf8_lossy(image) }))
    }
}

#[tokio::test]
async fn success_stores_result_exactly() {
    let (store, processor) = build(Arc::new(MockExtractor::returning(
        json!({"total_amount": 12.5, "items": []}),
    )));
    let id = store.create(b"fake-image".to_vec()).await.unwrap();

    assert_eq!(processor.run(&id).await.unwrap(), Processed::Completed);

    let task = store.get(&id).await.unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert_eq!(task.extracted_json, Some(json!({"total_amount": 12.5, "items": []})));
    assert!(task.error.is_none());
}

#[tokio::test]
async fn extractor_sees_stored_image_bytes() {
    let (store, processor) = build(Arc::new(EchoExtractor));
    let id = store.create(b"fake-image".to_vec()).await.unwrap();

    processor.process(&id).await;

    let task = store.get(&id).await.unwrap().unwrap();
    assert_eq!(task.extracted_json, Some(json!({"bytes": "fake-image"})));
}

#[tokio::test]
async fn failure_completes_with_empty_object() {
    let (store, processor) = build(Arc::new(MockExtractor::failing("401 Unauthorized")));
    let id = store.create(b"fake-image".to_vec()).await.unwrap();

    assert_eq!(processor.run(&id).await.unwrap(), Processed::Failed);

    let task = store.get(&id).await.unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert_eq!(task.extracted_json, Some(json!({})));
    assert!(task.error.unwrap().contains("401 Unauthorized"));
}

#[tokio::test]
async fn non_object_result_is_treated_as_failure() {
    let (store, processor) = build(Arc::new(MockExtractor::returning(json!(["not", "an", "object"]))));
    let id = store.create(b"img".to_vec()).await.unwrap();

    assert_eq!(processor.run(&id).await.unwrap(), Processed::Failed);
    let task = store.get(&id).await.unwrap().unwrap();
    assert_eq!(task.extracted_json, Some(json!({})));
}

#[tokio::test]
async fn timeout_completes_with_empty_object() {
    let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
    let processor = TaskProcessor::new(
        store.clone(),
        Arc::new(HangingExtractor),
        Duration::from_millis(50),
    );
    let id = store.create(b"img".to_vec()).await.unwrap();

    assert_eq!(processor.run(&id).await.unwrap(), Processed::Failed);

    let task = store.get(&id).await.unwrap().unwrap();
    assert_eq!(task.extracted_json, Some(json!({})));
    assert!(task.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn extractor_panic_completes_with_empty_object() {
    let (store, processor) = build(Arc::new(PanickingExtractor));
    let id = store.create(b"img".to_vec()).await.unwrap();

    assert_eq!(processor.run(&id).await.unwrap(), Processed::Failed);

    let task = store.get(&id).await.unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert_eq!(task.extracted_json, Some(json!({})));
    assert!(task.error.unwrap().contains("decoder blew up"));
}

#[tokio::test]
async fn dispatched_panic_does_not_leave_task_processing() {
    let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
    let processor = Arc::new(TaskProcessor::new(
        store.clone(),
        Arc::new(PanickingExtractor),
        Duration::from_secs(5),
    ));
    let (dispatcher, worker) = Dispatcher::start(processor, 1);
    let id = store.create(b"img".to_vec()).await.unwrap();

    assert!(dispatcher.dispatch(id.clone()));
    assert!(dispatcher.dispatch(id.clone()));
    drop(dispatcher);
    worker.join().await;

    let task = store.get(&id).await.unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert_eq!(task.extracted_json, Some(json!({})));
}

#[tokio::test]
async fn missing_task_is_a_silent_no_op() {
    let extractor = Arc::new(MockExtractor::returning(json!({})));
    let (_store, processor) = build(extractor.clone());

    assert_eq!(processor.run("nonexistent").await.unwrap(), Processed::Missing);
    processor.process("nonexistent").await;
    assert_eq!(extractor.calls(), 0);
}

#[tokio::test]
async fn second_run_does_not_call_extractor_again() {
    let extractor = Arc::new(MockExtractor::new(vec![
        MockReply::Json(json!({"store_name": "first"})),
        MockReply::Json(json!({"store_name": "second"})),
    ]));
    let (store, processor) = build(extractor.clone());
    let id = store.create(b"img".to_vec()).await.unwrap();

    assert_eq!(processor.run(&id).await.unwrap(), Processed::Completed);
    assert_eq!(processor.run(&id).await.unwrap(), Processed::Skipped);

    assert_eq!(extractor.calls(), 1);
    let task = store.get(&id).await.unwrap().unwrap();
    assert_eq!(task.extracted_json, Some(json!({"store_name": "first"})));
}

#[tokio::test]
async fn concurrent_runs_extract_once() {
    let extractor = Arc::new(MockExtractor::returning(json!({"items": []})));
    let (store, processor) = build(extractor.clone());
    let processor = Arc::new(processor);
    let id = store.create(b"img".to_vec()).await.unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let processor = Arc::clone(&processor);
            let id = id.clone();
            tokio::spawn(async move { processor.run(&id).await.unwrap() })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    assert_eq!(outcomes.iter().filter(|o| **o == Processed::Completed).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| **o == Processed::Skipped).count(), 3);
    assert_eq!(extractor.calls(), 1);
}

#[tokio::test]
async fn repeated_reads_after_completion_are_stable() {
    let (store, processor) = build(Arc::new(MockExtractor::returning(json!({"total_amount": 3}))));
    let id = store.create(b"img".to_vec()).await.unwrap();
    processor.process(&id).await;

    let first = store.get(&id).await.unwrap().unwrap();
    for _ in 0..3 {
        let again = store.get(&id).await.unwrap().unwrap();
        assert_eq!(again.extracted_json, first.extracted_json);
        assert_eq!(again.updated_at, first.updated_at);
    }
}
