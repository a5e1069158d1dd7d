//! In-process items service used by the integration tests

#![allow(dead_code)]

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regen_harness::ServiceConfig;

#[derive(Default)]
struct Inner {
    next_id: u64,
    items: BTreeMap<u64, Value>,
    broken: bool,
}

/// Handle onto the running mock service
#[derive(Clone, Default)]
pub struct ItemsService {
    inner: Arc<Mutex<Inner>>,
}

impl ItemsService {
    /// A broken service answers item creation with 500
    pub fn set_broken(&self, broken: bool) {
        self.inner.lock().unwrap().broken = broken;
    }

    pub fn item_count(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "uptime": 42}))
}

async fn list_items(State(svc): State<ItemsService>) -> Json<Value> {
    let inner = svc.inner.lock().unwrap();
    Json(Value::Array(inner.items.values().cloned().collect()))
}

async fn create_item(State(svc): State<ItemsService>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let mut inner = svc.inner.lock().unwrap();
    if inner.broken {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": "no such table: items"})),
        );
    }
    inner.next_id += 1;
    let id = inner.next_id;
    let mut item = body;
    if let Some(fields) = item.as_object_mut() {
        fields.insert("id".to_string(), json!(id));
    }
    inner.items.insert(id, item.clone());
    (StatusCode::CREATED, Json(item))
}

async fn get_item(State(svc): State<ItemsService>, Path(id): Path<u64>) -> (StatusCode, Json<Value>) {
    let inner = svc.inner.lock().unwrap();
    match inner.items.get(&id) {
        Some(item) => (StatusCode::OK, Json(item.clone())),
        None => (StatusCode::NOT_FOUND, Json(json!({"detail": "not found"}))),
    }
}

/// Start the service on an ephemeral port and return its base URL
pub async fn spawn_items_service() -> (String, ItemsService) {
    let svc = ItemsService::default();
    let app = Router::new()
        .route("/health", get(health))
        .route("/items", get(list_items).post(create_item))
        .route("/items/:id", get(get_item))
        .with_state(svc.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.expect("serve") });

    (format!("http://{}", addr), svc)
}

/// A base URL nothing listens on
pub fn unused_base_url() -> String {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    format!("http://127.0.0.1:{}", port)
}

/// Fast lifecycle settings with shell one-liners as commands
pub fn service_config(base_url: &str, start: &str, stop: &str) -> ServiceConfig {
    ServiceConfig {
        start_command: start.to_string(),
        stop_command: stop.to_string(),
        base_url: base_url.to_string(),
        startup_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(50),
        probe_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

pub const CRUD_SUITE: &str = r#"
test_suite: items-api
scenarios:
  - name: health
    steps:
      - name: health check
        endpoint: /health
        expected_response: { status: healthy }
  - name: crud
    steps:
      - name: create item
        method: POST
        endpoint: /items
        body: { name: widget, price: 29.99 }
        expected_status: 201
        expected_response: { name: widget, price: 29.99 }
        capture: { as: item_id, from: id }
      - name: fetch item
        endpoint: /items/{{item_id}}
        expected_response: { id: "{{item_id}}", name: widget }
        expected_response_contains: [id, name, price]
"#;

pub const READ_ONLY_SUITE: &str = r#"
scenarios:
  - name: health
    steps:
      - name: health check
        endpoint: /health
        expected_response: { status: healthy }
      - name: list
        endpoint: /items
        expected_response_type: array
  - name: missing
    steps:
      - name: unknown item
        endpoint: /items/999
        expected_status: 404
        expected_response_contains: [detail]
"#;
