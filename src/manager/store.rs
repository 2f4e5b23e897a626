//! SQLite-backed state store: the task queue and the executor table.
//!
//! The store is an IPC medium between the HTTP face and the dispatcher, not
//! durable state — the Web backend owns judgment state, and executors
//! re-register via heartbeat within one interval. The manager therefore
//! wipes both tables at startup.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub judgment_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ExecutorRow {
    pub id: i64,
    pub ip: String,
    /// Latest heartbeat payload, stored verbatim.
    pub data: String,
    pub idle: bool,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// A single connection keeps SQLite in its single-writer comfort zone;
    /// the arrival rate here is far below anything that would need more.
    pub async fn connect(url: &str) -> Result<Store, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        let store = Store { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 judgment_id INTEGER NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS executors (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 ip TEXT NOT NULL UNIQUE,
                 data TEXT NOT NULL,
                 last_updated TEXT NOT NULL DEFAULT (datetime('now')),
                 idle INTEGER NOT NULL DEFAULT 1
             )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop every row of both tables.
    pub async fn wipe(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tasks").execute(&self.pool).await?;
        sqlx::query("DELETE FROM executors").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn enqueue_task(&self, judgment_id: i64) -> Result<i64, StoreError> {
        let result = sqlx::query("INSERT INTO tasks (judgment_id) VALUES (?)")
            .bind(judgment_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn oldest_task(&self) -> Result<Option<TaskRow>, StoreError> {
        let task = sqlx::query_as("SELECT id, judgment_id FROM tasks ORDER BY id ASC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(task)
    }

    pub async fn delete_task(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn tasks(&self) -> Result<Vec<TaskRow>, StoreError> {
        let tasks = sqlx::query_as("SELECT id, judgment_id FROM tasks ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(tasks)
    }

    /// Create or refresh the executor row for `ip`. A refresh replaces the
    /// status blob and bumps `last_updated` but leaves `idle` alone — the
    /// dispatcher owns that bit.
    pub async fn upsert_executor(&self, ip: &str, data: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO executors (ip, data) VALUES (?, ?)
             ON CONFLICT(ip) DO UPDATE SET
                 data = excluded.data,
                 last_updated = datetime('now')",
        )
        .bind(ip)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn idle_executors(&self) -> Result<Vec<ExecutorRow>, StoreError> {
        let executors = sqlx::query_as(
            "SELECT id, ip, data, idle FROM executors WHERE idle = 1 ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(executors)
    }

    pub async fn executors(&self) -> Result<Vec<ExecutorRow>, StoreError> {
        let executors =
            sqlx::query_as("SELECT id, ip, data, idle FROM executors ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(executors)
    }

    /// Returns whether a row for `ip` existed.
    pub async fn set_idle_by_ip(&self, ip: &str, idle: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE executors SET idle = ? WHERE ip = ?")
            .bind(idle)
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a successful dispatch: the executor goes busy and the task
    /// leaves the queue in one transaction.
    pub async fn assign_task(&self, task_id: i64, executor_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE executors SET idle = 0 WHERE id = ?")
            .bind(executor_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_executor(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM executors WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn memory_store() -> Store {
        Store::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn tasks_come_out_fifo() {
        let store = memory_store().await;
        store.enqueue_task(42).await.unwrap();
        store.enqueue_task(43).await.unwrap();

        let first = store.oldest_task().await.unwrap().unwrap();
        assert_eq!(first.judgment_id, 42);
        store.delete_task(first.id).await.unwrap();

        let second = store.oldest_task().await.unwrap().unwrap();
        assert_eq!(second.judgment_id, 43);
        store.delete_task(second.id).await.unwrap();
        assert!(store.oldest_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_judgments_queue_independently() {
        let store = memory_store().await;
        store.enqueue_task(7).await.unwrap();
        store.enqueue_task(7).await.unwrap();
        assert_eq!(store.tasks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn heartbeats_upsert_one_row_per_ip() {
        let store = memory_store().await;
        store.upsert_executor("10.0.0.2", r#"{"is_alive": false}"#).await.unwrap();
        store.upsert_executor("10.0.0.2", r#"{"is_alive": true}"#).await.unwrap();

        let executors = store.executors().await.unwrap();
        assert_eq!(executors.len(), 1);
        assert_eq!(executors[0].ip, "10.0.0.2");
        assert_eq!(executors[0].data, r#"{"is_alive": true}"#);
        assert!(executors[0].idle);
    }

    #[tokio::test]
    async fn refresh_does_not_touch_the_idle_bit() {
        let store = memory_store().await;
        store.upsert_executor("10.0.0.2", "{}").await.unwrap();
        store.set_idle_by_ip("10.0.0.2", false).await.unwrap();
        store.upsert_executor("10.0.0.2", r#"{"is_alive": true}"#).await.unwrap();
        assert!(store.idle_executors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn idle_flip_reports_missing_rows() {
        let store = memory_store().await;
        assert!(!store.set_idle_by_ip("10.9.9.9", true).await.unwrap());
        store.upsert_executor("10.0.0.2", "{}").await.unwrap();
        assert!(store.set_idle_by_ip("10.0.0.2", true).await.unwrap());
    }

    #[tokio::test]
    async fn assignment_marks_busy_and_dequeues_together() {
        let store = memory_store().await;
        let task_id = store.enqueue_task(42).await.unwrap();
        store.upsert_executor("10.0.0.2", "{}").await.unwrap();
        let executor_id = store.executors().await.unwrap()[0].id;

        store.assign_task(task_id, executor_id).await.unwrap();

        assert!(store.tasks().await.unwrap().is_empty());
        assert!(store.idle_executors().await.unwrap().is_empty());
        assert!(!store.executors().await.unwrap()[0].idle);
    }

    #[tokio::test]
    async fn wipe_empties_both_tables() {
        let store = memory_store().await;
        store.enqueue_task(1).await.unwrap();
        store.upsert_executor("10.0.0.2", "{}").await.unwrap();
        store.wipe().await.unwrap();
        assert!(store.tasks().await.unwrap().is_empty());
        assert!(store.executors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn idle_listing_is_ordered_and_filtered() {
        let store = memory_store().await;
        store.upsert_executor("10.0.0.2", "{}").await.unwrap();
        store.upsert_executor("10.0.0.3", "{}").await.unwrap();
        store.upsert_executor("10.0.0.4", "{}").await.unwrap();
        store.set_idle_by_ip("10.0.0.3", false).await.unwrap();

        let idle = store.idle_executors().await.unwrap();
        let ips: Vec<&str> = idle.iter().map(|e| e.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.2", "10.0.0.4"]);
        assert!(idle[0].id < idle[1].id);
    }
}
