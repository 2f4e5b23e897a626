//! The dispatcher: a polling loop that marries the oldest task to the first
//! live idle executor.
//!
//! The state store is the only coordination medium with the HTTP face. An
//! executor that answers anything but `202` — or does not answer within the
//! dispatch timeout — is deleted on the spot; its next heartbeat recreates
//! it, so a flapping node oscillates in and out of the table and only nodes
//! proving liveness within the last interval receive work.

use super::store::{ExecutorRow, Store, StoreError};
use crate::config::CONFIG;
use reqwest::StatusCode;
use std::time::Duration;

const TICK_INTERVAL: Duration = Duration::from_secs(5);
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(store: Store) {
    let http = reqwest::Client::new();
    loop {
        tokio::time::sleep(TICK_INTERVAL).await;
        if let Err(e) = tick(&store, &http, CONFIG.executor_port).await {
            log::error!("database error: {}", e);
        }
    }
}

/// One dispatch attempt. At most one task is assigned per tick, and on any
/// dispatch failure the task is left queued for the next tick.
pub async fn tick(
    store: &Store,
    http: &reqwest::Client,
    executor_port: u16,
) -> Result<(), StoreError> {
    let task = match store.oldest_task().await? {
        Some(task) => task,
        None => {
            log::info!("task queue is empty");
            return Ok(());
        }
    };

    let idle = store.idle_executors().await?;
    let executor = match select_executor(&idle) {
        Some(executor) => executor,
        None => {
            log::warn!("no alive executor node");
            return Ok(());
        }
    };

    let url = format!(
        "http://{}:{}/api/judge/{}",
        executor.ip, executor_port, task.judgment_id
    );
    let response = http.post(&url).timeout(DISPATCH_TIMEOUT).send().await;
    match response {
        Ok(response) if response.status() == StatusCode::ACCEPTED => {
            store.assign_task(task.id, executor.id).await?;
            log::info!(
                "task (judgment ID: {}) assigned to executor {} at {}",
                task.judgment_id,
                executor.id,
                executor.ip
            );
        }
        Ok(response) => {
            log::warn!(
                "response from executor {} (at {}): {}",
                executor.id,
                executor.ip,
                response.status()
            );
            reap(store, executor.id).await?;
        }
        Err(e) => {
            if e.is_timeout() {
                log::warn!("executor {} timeout", executor.id);
            } else {
                log::warn!("dispatch request failed: {}", e);
            }
            reap(store, executor.id).await?;
        }
    }
    Ok(())
}

/// First idle executor (in id order) whose heartbeat blob parses and claims
/// liveness. Dead or corrupt rows are skipped, not deleted — reaping is
/// reserved for executors that fail an actual dispatch.
fn select_executor(idle: &[ExecutorRow]) -> Option<&ExecutorRow> {
    idle.iter().find(|row| {
        match serde_json::from_str::<serde_json::Value>(&row.data) {
            Ok(data) => data
                .get("is_alive")
                .and_then(|alive| alive.as_bool())
                .unwrap_or(false),
            Err(_) => {
                log::error!("cannot parse \"data\" field of executor {}", row.id);
                false
            }
        }
    })
}

async fn reap(store: &Store, executor_id: i64) -> Result<(), StoreError> {
    store.delete_executor(executor_id).await?;
    log::warn!("executor {} has been removed", executor_id);
    Ok(())
}
