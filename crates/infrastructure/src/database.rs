//! SQLite 任务仓储
//!
//! 状态写入带前置状态守卫：UPDATE 的 WHERE 包含当前状态，
//! 终态一旦写入就不会被并发写覆盖。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use webtask_config::DatabaseConfig;
use webtask_domain::{ExecutionOverrides, StatusCounts, Task, TaskRepository, TaskStatus};
use webtask_errors::{WebTaskError, WebTaskResult};

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 按配置连接 SQLite 并初始化表结构
    pub async fn connect(config: &DatabaseConfig) -> WebTaskResult<Self> {
        use std::str::FromStr;
        use std::time::Duration;

        let connect_options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(connect_options)
            .await?;

        Self::run_migrations(&pool).await?;
        info!("SQLite 任务存储已就绪: {}", config.url);
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> WebTaskResult<()> {
        debug!("初始化任务表结构");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instruction TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT '{}',
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                result TEXT,
                error_message TEXT,
                timeout_seconds INTEGER NOT NULL DEFAULT 300,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_pending
             ON tasks (status, priority DESC, created_at ASC)",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    fn row_to_task(row: &SqliteRow) -> WebTaskResult<Task> {
        let config: ExecutionOverrides = serde_json::from_str(row.try_get("config")?)?;
        let result = row
            .try_get::<Option<String>, _>("result")?
            .map(|s| serde_json::from_str(&s))
            .transpose()?;
        let status = TaskStatus::parse(row.try_get("status")?)?;

        Ok(Task {
            id: row.try_get("id")?,
            instruction: row.try_get("instruction")?,
            config,
            priority: row.try_get("priority")?,
            status,
            result,
            error_message: row.try_get("error_message")?,
            timeout_seconds: row.try_get::<i64, _>("timeout_seconds")? as u64,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    /// 区分「任务不存在」和「状态守卫拒绝」
    async fn classify_rejected_write(&self, id: i64, to: TaskStatus) -> WebTaskError {
        match self.get_by_id(id).await {
            Ok(Some(task)) => WebTaskError::InvalidStateTransition {
                from: task.status.as_str().to_string(),
                to: to.as_str().to_string(),
            },
            Ok(None) => WebTaskError::TaskNotFound { id },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> WebTaskResult<Task> {
        let config_json = serde_json::to_string(&task.config)?;
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (instruction, config, priority, status, timeout_seconds, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.instruction)
        .bind(&config_json)
        .bind(task.priority)
        .bind(task.status.as_str())
        .bind(task.timeout_seconds as i64)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("任务 {} 已入库，优先级 {}", id, task.priority);
        let mut stored = task.clone();
        stored.id = id;
        Ok(stored)
    }

    async fn get_by_id(&self, id: i64) -> WebTaskResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn list_pending(&self, limit: u32) -> WebTaskResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE status = 'pending'
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn set_running(&self, id: i64, started_at: DateTime<Utc>) -> WebTaskResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'running', started_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(started_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.classify_rejected_write(id, TaskStatus::Running).await);
        }
        Ok(())
    }

    async fn set_completed(
        &self,
        id: i64,
        result: serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> WebTaskResult<()> {
        let result_json = serde_json::to_string(&result)?;
        let outcome = sqlx::query(
            "UPDATE tasks SET status = 'completed', result = ?, completed_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(&result_json)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(self.classify_rejected_write(id, TaskStatus::Completed).await);
        }
        Ok(())
    }

    async fn set_failed(
        &self,
        id: i64,
        error: &str,
        partial_result: Option<serde_json::Value>,
        completed_at: DateTime<Utc>,
    ) -> WebTaskResult<()> {
        let partial_json = partial_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let outcome = sqlx::query(
            "UPDATE tasks SET status = 'failed', error_message = ?, result = ?, completed_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(error)
        .bind(&partial_json)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(self.classify_rejected_write(id, TaskStatus::Failed).await);
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> WebTaskResult<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_by_status(&self) -> WebTaskResult<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let n: i64 = row.try_get("n")?;
            match TaskStatus::parse(row.try_get("status")?)? {
                TaskStatus::Pending => counts.pending = n as u64,
                TaskStatus::Running => counts.running = n as u64,
                TaskStatus::Completed => counts.completed = n as u64,
                TaskStatus::Failed => counts.failed = n as u64,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use webtask_testing_utils::TaskBuilder;

    async fn test_repository() -> (SqliteTaskRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}/tasks.db", dir.path().display()),
            max_connections: 5,
            connection_timeout_seconds: 5,
        };
        (SqliteTaskRepository::connect(&config).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn test_create_and_get_round_trip() {
        let (repo, _dir) = test_repository().await;
        let task = TaskBuilder::new()
            .with_instruction("打开首页并截图")
            .with_priority(3)
            .with_timeout(120)
            .build();

        let stored = repo.create(&task).await.unwrap();
        assert!(stored.id > 0);

        let fetched = repo.get_by_id(stored.id).await.unwrap().unwrap();
        assert_eq!(fetched.instruction, "打开首页并截图");
        assert_eq!(fetched.priority, 3);
        assert_eq!(fetched.timeout_seconds, 120);
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert!(fetched.result.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let (repo, _dir) = test_repository().await;
        assert!(repo.get_by_id(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_pending_orders_by_priority_then_created() {
        let (repo, _dir) = test_repository().await;
        let low_old = repo
            .create(&TaskBuilder::new().with_priority(1).created_seconds_ago(60).build())
            .await
            .unwrap();
        let low_new = repo
            .create(&TaskBuilder::new().with_priority(1).created_seconds_ago(10).build())
            .await
            .unwrap();
        let high = repo
            .create(&TaskBuilder::new().with_priority(9).created_seconds_ago(1).build())
            .await
            .unwrap();

        let pending = repo.list_pending(10).await.unwrap();
        let ids: Vec<i64> = pending.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high.id, low_old.id, low_new.id]);

        // limit 生效
        assert_eq!(repo.list_pending(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_updates() {
        let (repo, _dir) = test_repository().await;
        let task = repo.create(&TaskBuilder::new().build()).await.unwrap();

        repo.set_running(task.id, Utc::now()).await.unwrap();
        let running = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());

        repo.set_completed(task.id, json!({"success": true}), Utc::now())
            .await
            .unwrap();
        let completed = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert_eq!(completed.result.unwrap()["success"], true);
        assert!(completed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_set_failed_keeps_partial_result() {
        let (repo, _dir) = test_repository().await;
        let task = repo.create(&TaskBuilder::new().build()).await.unwrap();
        repo.set_running(task.id, Utc::now()).await.unwrap();

        repo.set_failed(task.id, "任务执行超时", Some(json!({"steps_executed": 2})), Utc::now())
            .await
            .unwrap();
        let failed = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("任务执行超时"));
        assert_eq!(failed.result.unwrap()["steps_executed"], 2);
    }

    #[tokio::test]
    async fn test_status_guard_rejects_illegal_transitions() {
        let (repo, _dir) = test_repository().await;
        let task = repo.create(&TaskBuilder::new().build()).await.unwrap();

        // pending 不能直接完成
        let err = repo
            .set_completed(task.id, json!({}), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, WebTaskError::InvalidStateTransition { .. }));

        repo.set_running(task.id, Utc::now()).await.unwrap();
        repo.set_completed(task.id, json!({}), Utc::now()).await.unwrap();

        // 终态不可覆盖
        let err = repo
            .set_failed(task.id, "后到的失败", None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, WebTaskError::InvalidStateTransition { .. }));
        let stored = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);

        // 不存在的任务
        let err = repo.set_running(9999, Utc::now()).await.unwrap_err();
        assert!(matches!(err, WebTaskError::TaskNotFound { id: 9999 }));
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let (repo, _dir) = test_repository().await;
        let overrides = ExecutionOverrides {
            navigation_timeout_ms: Some(60_000),
            max_steps: Some(50),
            ..Default::default()
        };
        let task = repo
            .create(&TaskBuilder::new().with_config(overrides.clone()).build())
            .await
            .unwrap();

        let fetched = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.config, overrides);
    }

    #[tokio::test]
    async fn test_delete_and_counts() {
        let (repo, _dir) = test_repository().await;
        let a = repo.create(&TaskBuilder::new().build()).await.unwrap();
        let b = repo.create(&TaskBuilder::new().build()).await.unwrap();
        repo.set_running(b.id, Utc::now()).await.unwrap();

        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.total(), 2);

        assert!(repo.delete(a.id).await.unwrap());
        assert!(!repo.delete(a.id).await.unwrap());
        assert_eq!(repo.count_by_status().await.unwrap().total(), 1);
    }
}
