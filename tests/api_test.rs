use axum::{
    Router,
    body::Body,
    http::{Request, Response, StatusCode, header},
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt; // for `oneshot`

use spiderq::api::router;
use spiderq::api::state::AppState;
use spiderq::proto::{HEADER_DELIVERY_MODE, HEADER_DELIVERY_TAG, HEADER_REDELIVERED, Task};
use spiderq::queue::{FjallQueue, QueueBroker};

const MAX_MESSAGE_BYTES: usize = 1024;

/// Builds a broker router over a fresh store
fn build_test_app() -> (Router, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = FjallQueue::open(temp_dir.path()).expect("Failed to open test queue");
    let broker = Arc::new(QueueBroker::new(store, Duration::from_secs(60)));

    (router(AppState::new(broker, MAX_MESSAGE_BYTES)), temp_dir)
}

fn request(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder().method(method).uri(uri)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    request(method, uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    request(method, uri).body(Body::empty()).unwrap()
}

fn publish_request(queue: &str, body: Vec<u8>, mode: &str) -> Request<Body> {
    request("POST", &format!("/queues/{}/messages", queue))
        .header(HEADER_DELIVERY_MODE, mode)
        .body(Body::from(body))
        .unwrap()
}

async fn body_json(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

async fn declare(app: &Router, queue: &str) {
    let response = send(
        app,
        json_request("PUT", &format!("/queues/{}", queue), json!({"durable": true})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

async fn subscribe(app: &Router, queue: &str) -> String {
    let response = send(
        app,
        json_request(
            "POST",
            &format!("/queues/{}/consumers", queue),
            json!({"prefetch": 1}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["consumer_id"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_health() {
    let (app, _temp) = build_test_app();

    let response = send(&app, empty_request("GET", "/health")).await;

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_declare_is_idempotent() {
    let (app, _temp) = build_test_app();
    declare(&app, "tasks").await;
    declare(&app, "tasks").await;

    let response = send(&app, empty_request("GET", "/queues/tasks")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["queue"], "tasks");
    assert_eq!(stats["durable"], true);
    assert_eq!(stats["ready"], 0);
}

#[tokio::test]
async fn test_declare_with_other_durability_conflicts() {
    let (app, _temp) = build_test_app();
    declare(&app, "tasks").await;

    let response = send(
        &app,
        json_request("PUT", "/queues/tasks", json!({"durable": false})),
    )
    .await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_queue_is_not_found() {
    let (app, _temp) = build_test_app();

    let response = send(&app, empty_request("GET", "/queues/missing")).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "QUEUE_NOT_FOUND");
}

#[tokio::test]
async fn test_invalid_queue_name_is_bad_request() {
    let (app, _temp) = build_test_app();

    let response = send(
        &app,
        json_request("PUT", "/queues/bad%20name", json!({"durable": true})),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_publish_deliver_ack() {
    let (app, _temp) = build_test_app();
    declare(&app, "tasks").await;
    let task = Task::new("https://google.com", "/srv/pages/RO");

    let response = send(&app, publish_request("tasks", task.to_bytes().unwrap(), "2")).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let consumer = subscribe(&app, "tasks").await;
    let response = send(
        &app,
        empty_request("POST", &format!("/consumers/{}/deliveries?wait_ms=0", consumer)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[HEADER_REDELIVERED], "false");
    let tag = response.headers()[HEADER_DELIVERY_TAG]
        .to_str()
        .unwrap()
        .to_string();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(Task::from_bytes(&body).unwrap(), task);

    let response = send(
        &app,
        empty_request(
            "POST",
            &format!("/consumers/{}/deliveries/{}/ack", consumer, tag),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let stats = body_json(send(&app, empty_request("GET", "/queues/tasks")).await).await;
    assert_eq!(stats["ready"], 0);
    assert_eq!(stats["unacked"], 0);
}

#[tokio::test]
async fn test_prefetch_limits_outstanding_deliveries() {
    let (app, _temp) = build_test_app();
    declare(&app, "tasks").await;
    for i in 0..2 {
        send(&app, publish_request("tasks", format!("{}", i).into_bytes(), "2")).await;
    }
    let consumer = subscribe(&app, "tasks").await;
    let deliveries = format!("/consumers/{}/deliveries?wait_ms=0", consumer);

    let first = send(&app, empty_request("POST", &deliveries)).await;
    let second = send(&app, empty_request("POST", &deliveries)).await;

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_cancel_requeues_as_redelivered() {
    let (app, _temp) = build_test_app();
    declare(&app, "tasks").await;
    send(&app, publish_request("tasks", b"{}".to_vec(), "2")).await;

    let first = subscribe(&app, "tasks").await;
    send(
        &app,
        empty_request("POST", &format!("/consumers/{}/deliveries?wait_ms=0", first)),
    )
    .await;
    let response = send(&app, empty_request("DELETE", &format!("/consumers/{}", first))).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let second = subscribe(&app, "tasks").await;
    let response = send(
        &app,
        empty_request("POST", &format!("/consumers/{}/deliveries?wait_ms=0", second)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[HEADER_REDELIVERED], "true");
}

#[tokio::test]
async fn test_purge_reports_count() {
    let (app, _temp) = build_test_app();
    declare(&app, "tasks").await;
    for _ in 0..3 {
        send(&app, publish_request("tasks", b"{}".to_vec(), "1")).await;
    }

    let response = send(&app, empty_request("DELETE", "/queues/tasks/messages")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["purged"], 3);
}

#[tokio::test]
async fn test_unknown_tag_is_not_found() {
    let (app, _temp) = build_test_app();
    declare(&app, "tasks").await;
    let consumer = subscribe(&app, "tasks").await;

    let response = send(
        &app,
        empty_request("POST", &format!("/consumers/{}/deliveries/99/ack", consumer)),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "UNKNOWN_DELIVERY_TAG");
}

#[tokio::test]
async fn test_invalid_delivery_mode_is_rejected() {
    let (app, _temp) = build_test_app();
    declare(&app, "tasks").await;

    let response = send(&app, publish_request("tasks", b"{}".to_vec(), "7")).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_oversized_message_is_rejected() {
    let (app, _temp) = build_test_app();
    declare(&app, "tasks").await;

    let response = send(
        &app,
        publish_request("tasks", vec![b'x'; MAX_MESSAGE_BYTES + 1], "2"),
    )
    .await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
