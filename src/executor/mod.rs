//! Executor node: judgment intake over HTTP plus the heartbeat reporter.
//!
//! Intake is synchronous up to the pipeline spawn: the submission and its
//! problem are resolved against the Web backend, the working directory is
//! materialized, and the pipeline is started as a child process that reports
//! on its own. `202` only promises "the pipeline is running".

pub mod reporter;
pub mod template;
pub mod validate;
pub mod workdir;

use crate::client::model::{FunctionRequirement, Judgment, Problem, Submission, SubmissionCode};
use crate::client::{ApiClient, ApiError};
use crate::config::CONFIG;
use crate::opt::ExecutorSubCmd;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use template::{TemplateError, TemplateManager};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Workdir(#[from] workdir::WorkdirError),
    #[error("io error during judgment intake: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
pub struct ExecutorState {
    api: Arc<ApiClient>,
    templates: Arc<TemplateManager>,
}

impl ExecutorState {
    pub fn new(api: Arc<ApiClient>) -> ExecutorState {
        ExecutorState {
            templates: Arc::new(TemplateManager::new(api.clone())),
            api,
        }
    }
}

pub async fn run(cmd: ExecutorSubCmd) -> anyhow::Result<()> {
    let state = ExecutorState::new(Arc::new(ApiClient::new("executor")?));

    tokio::spawn(reporter::StatusReporter::new(cmd.port).run());

    let addr = format!("{}:{}", cmd.host, cmd.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("executor listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: ExecutorState) -> Router {
    Router::new()
        .route("/alive", get(is_alive))
        .route("/api/judge/:judgment_id", post(judge_judgment))
        .with_state(state)
}

async fn is_alive() -> StatusCode {
    StatusCode::OK
}

async fn judge_judgment(
    State(state): State<ExecutorState>,
    Path(judgment_id): Path<i64>,
) -> Response {
    match intake(&state, judgment_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            log::error!("judge intake failed for judgment {}: {}", judgment_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn intake(state: &ExecutorState, judgment_id: i64) -> Result<(), IntakeError> {
    let api = &state.api;

    let judgment: Judgment = api.get(&format!("/api/judgments/{}", judgment_id)).await?;
    log::info!("submission ID {} obtained", judgment.submission_id);

    let submission: Submission = api
        .get(&format!("/api/submissions/{}", judgment.submission_id))
        .await?;
    let problem: Problem = api
        .get(&format!("/api/problems/{}", submission.problem_id))
        .await?;
    let unit_test = if problem.has_autograder {
        problem.unit_test_name.clone().filter(|name| !name.is_empty())
    } else {
        None
    };
    log::info!("problem info obtained: has_autograder={}", problem.has_autograder);

    let code: SubmissionCode = api
        .get(&format!("/api/submissions/{}/code", judgment.submission_id))
        .await?;
    log::info!("source code attachment ID {} obtained", code.attachment_id);

    let zip_path = CONFIG
        .tmp_dir
        .join(format!("submission_{}.zip", judgment.submission_id));
    api.download(
        &format!("/api/submissions/attachments/{}", code.attachment_id),
        &zip_path,
    )
    .await?;
    log::info!("source code file saved");

    let template = state.templates.get_template(problem.template_id).await?;
    let working_dir = CONFIG.working_dir(judgment_id);
    {
        let template_path = template.path.clone();
        let working_dir = working_dir.clone();
        let zip_path = zip_path.clone();
        tokio::task::spawn_blocking(move || {
            workdir::materialize(&template_path, &working_dir, &zip_path)
        })
        .await??;
    }
    tokio::fs::remove_file(&zip_path).await?;
    log::info!("submission unpacked over template into {}", working_dir.display());

    let requirements = fetch_function_requirements(api, problem.id).await?;

    let current_exe = std::env::current_exe()?;
    let mut pipeline = tokio::process::Command::new(current_exe);
    pipeline
        .arg("validate")
        .arg(judgment_id.to_string())
        .arg(&working_dir);
    if let Some(unit_test) = &unit_test {
        pipeline.arg("--unit-test").arg(unit_test);
    }
    if let Some(requirements) = &requirements {
        pipeline.arg("--function-requirements").arg(requirements);
    }
    // The child reports its own result; intake never waits for it.
    pipeline.spawn()?;
    log::info!("validator started for judgment {}", judgment_id);

    Ok(())
}

/// An empty or malformed requirement list means "no extraction", matching
/// the backend's semantics for problems without function requirements.
async fn fetch_function_requirements(
    api: &ApiClient,
    problem_id: i64,
) -> Result<Option<String>, ApiError> {
    let raw: serde_json::Value = api
        .get(&format!("/api/problems/{}/functions", problem_id))
        .await?;
    match serde_json::from_value::<Vec<FunctionRequirement>>(raw) {
        Ok(list) if list.is_empty() => Ok(None),
        Ok(list) => {
            log::info!("{} function requirements fetched", list.len());
            Ok(serde_json::to_string(&list).ok())
        }
        Err(e) => {
            log::warn!("malformed function requirement list, skipping extraction: {}", e);
            Ok(None)
        }
    }
}
