//! Task intake and result sink, end to end through the manager router.

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use oj_judger::client::ApiClient;
use oj_judger::manager::store::Store;
use oj_judger::manager::{router, ManagerState};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

async fn test_state() -> ManagerState {
    ManagerState {
        store: Store::connect("sqlite::memory:").await.unwrap(),
        api: Arc::new(ApiClient::new("manager").unwrap()),
    }
}

fn post(path: &str, body: Option<&str>, peer: &str) -> Request<Body> {
    let body = match body {
        Some(raw) => Body::from(raw.to_owned()),
        None => Body::empty(),
    };
    let mut request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let addr: SocketAddr = format!("{}:41234", peer).parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

#[tokio::test]
async fn intake_enqueues_one_task_per_request() {
    let state = test_state().await;
    let store = state.store.clone();
    let app = router(state);

    let response = app
        .clone()
        .oneshot(post("/api/judge/42", None, "10.0.0.9"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(bytes.is_empty());

    // Resubmission is not deduplicated; the queue stays FIFO.
    let response = app
        .oneshot(post("/api/judge/42", None, "10.0.0.9"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let tasks = store.tasks().await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].judgment_id, 42);
    assert!(tasks[0].id < tasks[1].id);
}

#[tokio::test]
async fn result_from_unknown_executor_is_404() {
    let state = test_state().await;
    let response = router(state)
        .oneshot(post(
            "/api/judge/42/result",
            Some(r#"{"result": "passed", "log": ""}"#),
            "10.0.0.2",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn result_marks_the_executor_idle_again() {
    let state = test_state().await;
    let store = state.store.clone();
    store
        .upsert_executor("10.0.0.2", r#"{"is_alive": true}"#)
        .await
        .unwrap();
    store.set_idle_by_ip("10.0.0.2", false).await.unwrap();

    // Web-backend forwarding fails in this environment; that must not leak
    // into the executor-facing status.
    let response = router(state)
        .oneshot(post(
            "/api/judge/42/result",
            Some(r#"{"result": "failed", "log": "error: 'x' was not declared"}"#),
            "10.0.0.2",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let executors = store.executors().await.unwrap();
    assert_eq!(executors.len(), 1);
    assert!(executors[0].idle);
}

#[tokio::test]
async fn result_without_a_body_is_400_but_flips_idle_first() {
    let state = test_state().await;
    let store = state.store.clone();
    store
        .upsert_executor("10.0.0.2", r#"{"is_alive": true}"#)
        .await
        .unwrap();
    store.set_idle_by_ip("10.0.0.2", false).await.unwrap();

    let response = router(state)
        .oneshot(post("/api/judge/42/result", None, "10.0.0.2"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(store.executors().await.unwrap()[0].idle);
}
