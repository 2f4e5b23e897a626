//! Periodic self-report of executor status to the manager.
//!
//! Every probe degrades independently: a broken `lscpu` still leaves the
//! hostname and liveness fields intact, and the report is posted regardless.
//! The manager deletes executors that fail dispatch, so this loop is also
//! what resurrects a reaped executor on its next beat.

use crate::client::model::ExecutorStatus;
use crate::config::CONFIG;
use std::time::Duration;
use tokio::process::Command;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StatusReporter {
    http: reqwest::Client,
    executors_endpoint: String,
    alive_endpoint: String,
}

impl StatusReporter {
    /// `port` is the port the local judge face actually listens on; the
    /// liveness probe loops back to it.
    pub fn new(port: u16) -> StatusReporter {
        StatusReporter {
            http: reqwest::Client::new(),
            executors_endpoint: CONFIG.executors_endpoint(),
            alive_endpoint: format!("http://127.0.0.1:{}/alive", port),
        }
    }

    pub async fn run(self) {
        log::info!("starting status reporter");
        let interval = Duration::from_secs(CONFIG.keep_alive_interval * 60);
        loop {
            self.report().await;
            tokio::time::sleep(interval).await;
        }
    }

    async fn report(&self) {
        let status = self.collect_status().await;
        let result = self
            .http
            .post(&self.executors_endpoint)
            .timeout(REPORT_TIMEOUT)
            .json(&status)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => log::info!("status reported successfully: {:?}", status),
            Err(e) => log::error!("failed to report status: {}", e),
        }
    }

    async fn collect_status(&self) -> ExecutorStatus {
        let (cpu_model_name, n_cpus) = self.cpu_info().await;
        ExecutorStatus {
            hostname: hostname(),
            cpu_model_name,
            n_cpus,
            memory_mib: self.memory_mib().await,
            is_alive: self.service_alive().await,
        }
    }

    async fn cpu_info(&self) -> (String, u32) {
        let probed = Command::new("lscpu")
            .arg("-p=cpu,modelname")
            .output()
            .await;
        match probed {
            Ok(output) if output.status.success() => {
                match parse_lscpu(&String::from_utf8_lossy(&output.stdout)) {
                    Some(info) => info,
                    None => {
                        log::error!("unexpected lscpu output");
                        ("unknown".to_owned(), 0)
                    }
                }
            }
            Ok(output) => {
                log::error!("lscpu exited with {}", output.status);
                ("unknown".to_owned(), 0)
            }
            Err(e) => {
                log::error!("failed to get cpu info: {}", e);
                ("unknown".to_owned(), 0)
            }
        }
    }

    async fn memory_mib(&self) -> u64 {
        let probed = Command::new("free").arg("-m").output().await;
        match probed {
            Ok(output) if output.status.success() => {
                match parse_free(&String::from_utf8_lossy(&output.stdout)) {
                    Some(mib) => mib,
                    None => {
                        log::error!("unexpected free output");
                        0
                    }
                }
            }
            Ok(output) => {
                log::error!("free exited with {}", output.status);
                0
            }
            Err(e) => {
                log::error!("failed to get memory info: {}", e);
                0
            }
        }
    }

    async fn service_alive(&self) -> bool {
        let response = self
            .http
            .get(&self.alive_endpoint)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        match response {
            Ok(r) => r.status() == reqwest::StatusCode::OK,
            Err(e) => {
                log::error!("service alive check failed: {}", e);
                false
            }
        }
    }
}

fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            log::error!("failed to get hostname: {}", e);
            "unknown".to_owned()
        }
    }
}

/// `lscpu -p=cpu,modelname` ends with one data row per logical CPU, e.g.
/// `19,Intel Core i5`; the last row carries the highest index, so the count
/// is that index plus one.
fn parse_lscpu(output: &str) -> Option<(String, u32)> {
    let last = output.lines().rev().find(|l| !l.trim().is_empty())?;
    let (index, model) = last.split_once(',')?;
    let n_cpus: u32 = index.trim().parse().ok()?;
    Some((model.trim().to_owned(), n_cpus + 1))
}

/// Total memory in MiB: second line, second field of `free -m`.
fn parse_free(output: &str) -> Option<u64> {
    output
        .lines()
        .nth(1)?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}
