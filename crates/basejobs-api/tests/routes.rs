//! Router tests against the in-process backend.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::watch;
use tower::ServiceExt;

use basejobs_api::{create_router, ApiConfig, AppState};
use basejobs_models::{JobStatus, Room, ServerMessage};
use basejobs_queue::{FallbackBackend, QueueBackend, QueueConfig, SharedQueue};
use basejobs_worker::{build_registry, BaseRepository, BaseSnapshot, FileBaseRepository, LocalFileStorage};

struct TestApp {
    router: Router,
    state: AppState,
    queue: SharedQueue,
    _dir: TempDir,
}

async fn test_app(queue_config: QueueConfig) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let bases = Arc::new(FileBaseRepository::new(dir.path().join("bases")));
    let storage = Arc::new(LocalFileStorage::new(dir.path().join("exports"), None));

    let mut base = BaseSnapshot::new("b1", "Project tracker");
    base.merge_table(basejobs_worker::TableData {
        name: "Tasks".to_string(),
        columns: Vec::new(),
        rows: Vec::new(),
    });
    bases.save(&base).await.unwrap();

    let queue: SharedQueue = Arc::new(FallbackBackend::new(
        queue_config,
        build_registry(bases, storage),
    ));
    let state = AppState::new(ApiConfig::default(), queue.clone());

    TestApp {
        router: create_router(state.clone(), None),
        state,
        queue,
        _dir: dir,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn enqueue(router: &Router, body: Value) -> String {
    let (status, body) = send(router, post_json("/api/jobs", &body.to_string())).await;
    assert_eq!(status, StatusCode::ACCEPTED, "body: {}", body);
    body["jobId"].as_str().unwrap().to_string()
}

async fn wait_terminal(router: &Router, job_id: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (status, job) = send(router, get(&format!("/api/jobs/{}", job_id))).await;
            assert_eq!(status, StatusCode::OK);
            if job["status"] == "completed" || job["status"] == "failed" {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

#[tokio::test]
async fn test_enqueue_returns_accepted_and_waiting_status() {
    let app = test_app(QueueConfig::default()).await;

    let job_id = enqueue(&app.router, json!({"type": "export", "payload": {"baseId": "b1"}})).await;

    let (status, job) = send(&app.router, get(&format!("/api/jobs/{}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["id"], job_id.as_str());
    assert_eq!(job["type"], "export");
    assert_eq!(job["status"], "waiting");
    assert_eq!(job["ownerContext"], "b1");

    let (status, logs) = send(&app.router, get(&format!("/api/jobs/{}/logs", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(logs["jobId"], job_id.as_str());
    assert_eq!(logs["logs"], json!([]));
}

#[tokio::test]
async fn test_enqueue_error_mapping() {
    let app = test_app(QueueConfig::default()).await;

    let (status, body) = send(
        &app.router,
        post_json("/api/jobs", r#"{"type":"compress","payload":{"baseId":"b1"}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "UnknownJobType");

    let (status, body) = send(
        &app.router,
        post_json("/api/jobs", r#"{"type":"export","payload":{"tables":["Tasks"]}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "ValidationError");

    let (status, body) = send(&app.router, post_json("/api/jobs", r#"{"type":"export","payload":[1]}"#)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "ValidationError");

    let (status, body) = send(&app.router, post_json("/api/jobs", "{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BadRequest");
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let app = test_app(QueueConfig::default()).await;

    let (status, body) = send(
        &app.router,
        get("/api/jobs/550e8400-e29b-41d4-a716-446655440000"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NotFound");

    let (status, _) = send(&app.router, get("/api/jobs/bad.id/logs")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_full_queue_is_service_unavailable() {
    let app = test_app(QueueConfig {
        max_queue_len: 1,
        ..QueueConfig::default()
    })
    .await;

    enqueue(&app.router, json!({"type": "export", "payload": {"baseId": "b1"}})).await;

    let (status, body) = send(
        &app.router,
        post_json("/api/jobs", r#"{"type":"export","payload":{"baseId":"b1"}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "QueueFull");
}

#[tokio::test]
async fn test_export_runs_to_completion() {
    let app = test_app(QueueConfig::default()).await;
    app.queue.start().await.unwrap();

    let job_id = enqueue(&app.router, json!({"type": "export", "payload": {"baseId": "b1"}})).await;
    let job = wait_terminal(&app.router, &job_id).await;

    assert_eq!(job["status"], "completed");
    assert!(!job["result"]["fileUrl"].as_str().unwrap().is_empty());
    assert!(job.get("error").is_none());

    let (_, logs) = send(&app.router, get(&format!("/api/jobs/{}/logs", job_id))).await;
    assert!(!logs["logs"].as_array().unwrap().is_empty());

    app.queue.shutdown().await;
}

#[tokio::test]
async fn test_health_and_ready() {
    let app = test_app(QueueConfig::default()).await;

    let (status, body) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(&app.router, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["mode"], "fallback");
    assert_eq!(body["checks"]["queue"]["status"], "ok");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = test_app(QueueConfig::default()).await;

    let request = Request::builder()
        .uri("/health")
        .header("X-Request-ID", "req-123")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.headers()["X-Request-ID"], "req-123");
}

#[tokio::test]
async fn test_gateway_relays_job_events_to_its_room() {
    let app = test_app(QueueConfig::default()).await;
    let gateway = app.state.gateway.clone();

    let (member, mut member_rx) = gateway.connect().await;
    let (outsider, mut outsider_rx) = gateway.connect().await;
    gateway.subscribe(member, Room::new("b1")).await;
    gateway.subscribe(outsider, Room::new("b2")).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = tokio::spawn(gateway.clone().run(app.queue.clone(), shutdown_rx));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let job_id = enqueue(&app.router, json!({"type": "export", "payload": {"baseId": "b1"}})).await;
    app.queue.start().await.unwrap();

    let mut last_status = None;
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), member_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let ServerMessage::Event { event } = msg else {
            panic!("unexpected message: {:?}", msg);
        };
        assert_eq!(event.job_id.as_str(), job_id);
        last_status = Some(event.status);
        if event.is_terminal() {
            break;
        }
    }
    assert_eq!(last_status, Some(JobStatus::Completed));
    assert!(outsider_rx.try_recv().is_err());

    shutdown_tx.send(true).unwrap();
    relay.await.unwrap();
    app.queue.shutdown().await;
}
