//! Manager node: task intake, result sink and executor heartbeat sink, with
//! the dispatcher running alongside as a background task.
//!
//! All three routes identify executors by remote address, which is why the
//! server is built with connect info. Forwarding to the Web backend is
//! best-effort: once an executor has delivered its result, nothing that goes
//! wrong upstream is allowed to fail its request.

pub mod dispatch;
pub mod store;

use crate::client::model::{FunctionImplCreated, Judgment, JudgmentResult, VerdictKind};
use crate::client::{ApiClient, ApiError};
use crate::config::CONFIG;
use crate::opt::ManagerSubCmd;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use store::Store;

#[derive(Clone)]
pub struct ManagerState {
    pub store: Store,
    pub api: Arc<ApiClient>,
}

pub async fn run(cmd: ManagerSubCmd) -> anyhow::Result<()> {
    let store = Store::connect(&CONFIG.database_url).await?;
    // The store is an IPC medium; rows from a previous run are meaningless.
    store.wipe().await?;

    let api = Arc::new(ApiClient::new("manager")?);
    let state = ManagerState { store: store.clone(), api };

    tokio::spawn(dispatch::run(store));

    let addr = format!("{}:{}", cmd.host, cmd.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("manager listening on {}", addr);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

pub fn router(state: ManagerState) -> Router {
    Router::new()
        .route("/api/judge/executors", post(update_executor_status))
        .route("/api/judge/:judgment_id", post(judge_submission))
        .route("/api/judge/:judgment_id/result", post(receive_judgment_result))
        .with_state(state)
}

/// Task intake. Enqueues and returns immediately; dispatch happens on the
/// dispatcher's own clock.
async fn judge_submission(
    State(state): State<ManagerState>,
    Path(judgment_id): Path<i64>,
) -> Response {
    match state.store.enqueue_task(judgment_id).await {
        Ok(task_id) => {
            log::info!("task {} (judgment {}) added to task queue", task_id, judgment_id);
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => {
            log::error!("cannot add new task to queue: {}", e);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// Result sink. The reporting executor is idle again from this moment on —
/// its row is flipped before any forwarding is attempted, and Web-backend
/// trouble is logged but never surfaced back to the executor.
async fn receive_judgment_result(
    State(state): State<ManagerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(judgment_id): Path<i64>,
    body: Option<Json<JudgmentResult>>,
) -> Response {
    let ip = addr.ip().to_string();
    match state.store.set_idle_by_ip(&ip, true).await {
        Ok(true) => {}
        Ok(false) => return error_json(StatusCode::NOT_FOUND, "Executor not found"),
        Err(e) => {
            log::error!("failed to receive judgment result: {}", e);
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
    }

    let Some(Json(result)) = body else {
        return error_json(StatusCode::BAD_REQUEST, "Missing result data");
    };

    if let Err(e) = forward_result(&state, judgment_id, &result).await {
        log::error!("failed to update judgment result: {}", e);
    }
    StatusCode::OK.into_response()
}

async fn forward_result(
    state: &ManagerState,
    judgment_id: i64,
    result: &JudgmentResult,
) -> Result<(), ApiError> {
    state
        .api
        .post_unit(
            &format!("/api/judgments/{}/result", judgment_id),
            &serde_json::json!({ "result": result.result, "log": result.log }),
        )
        .await?;

    if result.result == VerdictKind::Passed {
        if let Some(impls) = &result.function_impls {
            let judgment: Judgment = state
                .api
                .get(&format!("/api/judgments/{}", judgment_id))
                .await?;
            for implementation in impls {
                let created: FunctionImplCreated = state
                    .api
                    .post(
                        &format!("/api/submissions/{}/function_impls", judgment.submission_id),
                        &serde_json::json!({ "code": implementation }),
                    )
                    .await?;
                log::info!(
                    "function implementation sent to Web server, ID: {}",
                    created.function_impl_id
                );
            }
        }
    }
    Ok(())
}

/// Heartbeat sink: upsert by remote address, status blob stored verbatim.
async fn update_executor_status(
    State(state): State<ManagerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Option<Json<serde_json::Value>>,
) -> Response {
    let ip = addr.ip().to_string();
    log::info!("received executor status report from {}", ip);

    let Some(Json(data)) = body else {
        log::warn!("no status data");
        return error_json(StatusCode::BAD_REQUEST, "invalid JSON data");
    };

    match state.store.upsert_executor(&ip, &data.to_string()).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            log::error!("unexpected error occurred when updating executor: {}", e);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

fn error_json(status: StatusCode, message: impl ToString) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.to_string() })),
    )
        .into_response()
}
