//! The evaluation pipeline, run as a child process of the executor so the
//! HTTP face stays responsive while a judgment compiles.
//!
//! Steps: configure and build the project, run the autograder unit test if
//! the problem names one, extract required function implementations, report
//! the verdict to the manager. The first failing step short-circuits the
//! rest; the working directory is removed no matter how the run ends.

use crate::client::model::{FunctionRequirement, JudgmentResult, VerdictKind};
use crate::config::CONFIG;
use crate::extractor::{ExtractError, FunctionExtractor};
use crate::opt::ValidateSubCmd;
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub async fn run(cmd: ValidateSubCmd) -> anyhow::Result<()> {
    let _cleanup = WorkdirGuard(cmd.working_dir.clone());
    let report = match pipeline(&cmd).await {
        Ok(report) => report,
        Err(e) => {
            log::error!("pipeline internal error: {:#}", e);
            JudgmentResult {
                result: VerdictKind::Error,
                log: format!("{:#}", e),
                function_impls: None,
            }
        }
    };
    submit_result(cmd.judgment_id, &report).await;
    Ok(())
}

async fn pipeline(cmd: &ValidateSubCmd) -> anyhow::Result<JudgmentResult> {
    let dir = &cmd.working_dir;
    let n_proc = CONFIG.parallel_build;

    if let Some(log) = compile_project(dir, n_proc).await? {
        return Ok(failed(log));
    }

    if let Some(unit_test) = &cmd.unit_test {
        if let Some(log) = run_tests(dir, n_proc, unit_test).await? {
            return Ok(failed(log));
        }
    }

    let mut function_impls = None;
    if let Some(raw) = &cmd.function_requirements {
        let requirements: Vec<FunctionRequirement> = serde_json::from_str(raw)?;
        match extract_functions(dir.clone(), requirements).await? {
            Some(impls) => function_impls = Some(impls),
            None => return Ok(failed("required function implementation not found".to_owned())),
        }
    }

    Ok(JudgmentResult {
        result: VerdictKind::Passed,
        log: String::new(),
        function_impls,
    })
}

/// Configure and build the submission. `Some(log)` is a student-visible
/// build failure, `Err` a judge malfunction.
async fn compile_project(dir: &Path, n_proc: usize) -> anyhow::Result<Option<String>> {
    let build_dir = dir.join("build");
    tokio::fs::create_dir_all(&build_dir).await?;
    log::info!("directory build/ created");

    let mut configure = Command::new("cmake");
    configure.arg("-S").arg(dir).arg("-B").arg(&build_dir);
    let configure = run_captured(configure).await?;
    log::info!("CMake project configured");
    if !configure.success {
        return Ok(Some(configure.log));
    }

    let mut build = Command::new("cmake");
    build
        .arg("--build")
        .arg(&build_dir)
        .args(["--config", "Release", "--target", "dandelion", "--parallel"])
        .arg(n_proc.to_string());
    let build = run_captured(build).await?;
    if !build.success {
        return Ok(Some(build.log));
    }
    log::info!("successfully compiled project");
    Ok(None)
}

/// Build the `test` subproject and run the named autograder case.
async fn run_tests(dir: &Path, n_proc: usize, unit_test: &str) -> anyhow::Result<Option<String>> {
    let test_dir = dir.join("test");
    let test_build_dir = test_dir.join("build");
    tokio::fs::create_dir_all(&test_build_dir).await?;
    log::info!("directory test/build/ created");

    let mut configure = Command::new("cmake");
    configure.arg("-S").arg(&test_dir).arg("-B").arg(&test_build_dir);
    let configure = run_captured(configure).await?;
    log::info!("CMake test project configured");
    if !configure.success {
        return Ok(Some(configure.log));
    }

    let mut build = Command::new("cmake");
    build
        .arg("--build")
        .arg(&test_build_dir)
        .args(["--config", "Release", "--target", "test", "--parallel"])
        .arg(n_proc.to_string());
    let build = run_captured(build).await?;
    if !build.success {
        return Ok(Some(build.log));
    }
    log::info!("test program compiled");

    let mut test = Command::new(test_build_dir.join("test"));
    test.arg(unit_test);
    let test = run_captured(test).await?;
    log::info!("test executed");
    if !test.success {
        return Ok(Some(test.log));
    }
    Ok(None)
}

/// All-or-nothing extraction; libclang entities are not `Send`, so the whole
/// pass runs on the blocking pool.
async fn extract_functions(
    workdir: PathBuf,
    requirements: Vec<FunctionRequirement>,
) -> anyhow::Result<Option<Vec<String>>> {
    let extracted = tokio::task::spawn_blocking(move || {
        let extractor = FunctionExtractor::new(&workdir)?;
        let mut impls = Vec::with_capacity(requirements.len());
        for requirement in &requirements {
            match extractor.extract(requirement)? {
                Some(implementation) => {
                    log::info!(
                        "extracted implementation of {}",
                        requirement.function_signature.name
                    );
                    impls.push(implementation);
                }
                None => return Ok(None),
            }
        }
        Ok::<_, ExtractError>(Some(impls))
    })
    .await??;
    Ok(extracted)
}

async fn submit_result(judgment_id: i64, report: &JudgmentResult) {
    let url = CONFIG.result_endpoint(judgment_id);
    let response = reqwest::Client::new().post(&url).json(report).send().await;
    match response {
        Ok(r) if r.status() == reqwest::StatusCode::OK => {
            log::info!("result of judgment {} reported", judgment_id)
        }
        Ok(r) => log::error!("result report failed: {}", r.status()),
        Err(e) => log::error!("failed to reach the manager: {}", e),
    }
}

struct Captured {
    success: bool,
    log: String,
}

/// Run to completion, capturing stdout and stderr into one log chunk.
async fn run_captured(mut cmd: Command) -> std::io::Result<Captured> {
    let output = cmd.output().await?;
    let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
    log.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(Captured {
        success: output.status.success(),
        log,
    })
}

fn failed(log: String) -> JudgmentResult {
    JudgmentResult {
        result: VerdictKind::Failed,
        log,
        function_impls: None,
    }
}

/// Removes the working directory when the pipeline exits, success or not.
/// Removal errors are ignored; a leftover directory is overwritten by the
/// next judgment with the same id anyway.
struct WorkdirGuard(PathBuf);

impl Drop for WorkdirGuard {
    fn drop(&mut self) {
        if self.0.exists() {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captured_output_merges_both_streams() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo visible; echo hidden 1>&2; exit 3"]);
        let captured = run_captured(cmd).await.unwrap();
        assert!(!captured.success);
        assert!(captured.log.contains("visible"));
        assert!(captured.log.contains("hidden"));
    }

    #[tokio::test]
    async fn captured_success_on_zero_exit() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "true"]);
        assert!(run_captured(cmd).await.unwrap().success);
    }

    #[test]
    fn workdir_guard_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("judgement_for_0");
        std::fs::create_dir_all(workdir.join("build")).unwrap();
        {
            let _guard = WorkdirGuard(workdir.clone());
        }
        assert!(!workdir.exists());
    }

    #[test]
    fn failed_report_shape() {
        let report = failed("error: 'x' was not declared".to_owned());
        assert_eq!(report.result, VerdictKind::Failed);
        assert!(report.function_impls.is_none());
    }
}
