//! Heartbeat-sink coverage: every request is pushed through the manager
//! router with an injected peer address, the way the real server sees it.

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

fn json_post(path: &str, body: Option<&str>, peer: &str) -> Request<Body> {
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

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn empty_request_is_rejected() {
    let state = test_state().await;
    let response = router(state)
        .oneshot(json_post("/api/judge/executors", None, "10.0.0.2"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(response).await.contains("invalid JSON data"));
}

#[tokio::test]
async fn invalid_json_is_rejected() {
    let state = test_state().await;
    let response = router(state)
        .oneshot(json_post("/api/judge/executors", Some("{ invalid json"), "10.0.0.2"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let error: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert!(error["error"].as_str().unwrap().contains("invalid JSON data"));
}

#[tokio::test]
async fn valid_status_is_stored_verbatim() {
    let state = test_state().await;
    let store = state.store.clone();
    let status = serde_json::json!({
        "hostname": "node-01",
        "cpu_model_name": "Intel Xeon",
        "n_cpus": 8,
        "memory_mib": 16384,
        "is_alive": true
    });

    let response = router(state)
        .oneshot(json_post(
            "/api/judge/executors",
            Some(&status.to_string()),
            "10.0.0.2",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let executors = store.executors().await.unwrap();
    assert_eq!(executors.len(), 1);
    assert_eq!(executors[0].ip, "10.0.0.2");
    let stored: serde_json::Value = serde_json::from_str(&executors[0].data).unwrap();
    assert_eq!(stored, status);
}

#[tokio::test]
async fn repeated_reports_update_a_single_row() {
    let state = test_state().await;
    let store = state.store.clone();
    let app = router(state);

    let first = app
        .clone()
        .oneshot(json_post(
            "/api/judge/executors",
            Some(r#"{"hostname": "node-01", "is_alive": false}"#),
            "10.0.0.2",
        ))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(json_post(
            "/api/judge/executors",
            Some(r#"{"hostname": "node-01", "is_alive": true}"#),
            "10.0.0.2",
        ))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    let executors = store.executors().await.unwrap();
    assert_eq!(executors.len(), 1);
    let stored: serde_json::Value = serde_json::from_str(&executors[0].data).unwrap();
    assert_eq!(stored["is_alive"], serde_json::Value::Bool(true));
}
