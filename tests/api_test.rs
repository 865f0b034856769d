use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tower::ServiceExt;

use tally::api::{self, AppState};
use tally::dispatch::Dispatcher;
use tally::extractor::Extractor;
use tally::extractor::mock::MockExtractor;
use tally::processor::TaskProcessor;
use tally::store::TaskStore;
use tally::store::sqlite::SqliteTaskStore;

const BOUNDARY: &str = "tally-test-boundary";
const MAX_UPLOAD: usize = 1024 * 1024;

/// Blocks every extraction until the test opens the gate.
struct GatedExtractor {
    gate: Semaphore,
    result: Value,
}

#[async_trait]
impl Extractor for GatedExtractor {
    fn name(&self) -> &str {
        "gated"
    }

    async fn extract(&self, _image: &[u8]) -> Result<Value> {
        let _permit = self.gate.acquire().await?;
        Ok(self.result.clone())
    }
}

fn build_app(extractor: Arc<dyn Extractor>) -> Router {
    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::in_memory().unwrap());
    let processor = Arc::new(TaskProcessor::new(
        Arc::clone(&store),
        extractor,
        Duration::from_secs(5),
    ));
    let (dispatcher, _worker) = Dispatcher::start(processor, 2);
    api::router(AppState { store, dispatcher }, MAX_UPLOAD)
}

fn multipart_request(field: &str, content: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"receipt.jpg\"\r\n\
             Content-Type: image/jpeg\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/create_task")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create(app: &Router, content: &[u8]) -> String {
    let response = app
        .clone()
        .oneshot(multipart_request("file", content))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    body["task_id"].as_str().unwrap().to_string()
}

async fn poll(app: &Router, task_id: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(get_request(&format!("/get_task/{task_id}")))
        .await
        .unwrap();
    let status = response.status();
    (status, json_body(response).await)
}

/// Poll until the task leaves "processing", or give up.
async fn poll_until_completed(app: &Router, task_id: &str) -> Value {
    for _ in 0..200 {
        let (status, body) = poll(app, task_id).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == "completed" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never completed");
}

#[tokio::test]
async fn create_then_poll_reports_processing_until_extraction_lands() {
    let extractor = Arc::new(GatedExtractor {
        gate: Semaphore::new(0),
        result: json!({"total_amount": 12.5, "items": []}),
    });
    let app = build_app(extractor.clone());

    let task_id = create(&app, b"fake-image").await;

    let (status, body) = poll(&app, &task_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"task_id": task_id, "status": "processing"}));

    extractor.gate.add_permits(1);

    let body = poll_until_completed(&app, &task_id).await;
    assert_eq!(
        body,
        json!({
            "task_id": task_id,
            "status": "completed",
            "extracted_json": {"total_amount": 12.5, "items": []}
        })
    );
}

#[tokio::test]
async fn failed_extraction_polls_as_completed_with_empty_object() {
    let app = build_app(Arc::new(MockExtractor::failing("connection refused")));

    let task_id = create(&app, b"fake-image").await;
    let body = poll_until_completed(&app, &task_id).await;

    assert_eq!(
        body,
        json!({"task_id": task_id, "status": "completed", "extracted_json": {}})
    );
}

#[tokio::test]
async fn completed_task_polls_identically_every_time() {
    let app = build_app(Arc::new(MockExtractor::returning(json!({"store_name": "Lidl"}))));

    let task_id = create(&app, b"fake-image").await;
    let first = poll_until_completed(&app, &task_id).await;

    for _ in 0..3 {
        let (status, body) = poll(&app, &task_id).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, first);
    }
}

#[tokio::test]
async fn each_upload_gets_a_new_task_id() {
    let app = build_app(Arc::new(MockExtractor::returning(json!({}))));

    let a = create(&app, b"one").await;
    let b = create(&app, b"two").await;
    assert_ne!(a, b);
}

#[tokio::test]
async fn unknown_task_is_404() {
    let app = build_app(Arc::new(MockExtractor::returning(json!({}))));

    let (status, body) = poll(&app, "nonexistent").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "Task not found"}));
}

#[tokio::test]
async fn missing_file_field_is_400() {
    let app = build_app(Arc::new(MockExtractor::returning(json!({}))));

    let response = app
        .oneshot(multipart_request("image", b"fake-image"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("'file'"));
}

#[tokio::test]
async fn empty_file_is_400() {
    let app = build_app(Arc::new(MockExtractor::returning(json!({}))));

    let response = app.oneshot(multipart_request("file", b"")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
    let app = build_app(Arc::new(MockExtractor::returning(json!({}))));

    let big = vec![0u8; MAX_UPLOAD + 1];
    let response = app.oneshot(multipart_request("file", &big)).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn health_reports_ok() {
    let app = build_app(Arc::new(MockExtractor::returning(json!({}))));

    let response = app.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn unknown_route_is_404() {
    let app = build_app(Arc::new(MockExtractor::returning(json!({}))));

    let response = app.oneshot(get_request("/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
