//! SQLite storage backend.

use crate::rows::{ProblemRow, TaskRow, UserRow};
use crate::{count_queue, CredentialCipher, Repository, UserRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use ojforge_models::{
    Paging, ProblemRecord, ProblemState, QueueStats, SystemStats, TaskFilter, TaskListPage,
    TaskRecord, TaskStatus,
};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    salt TEXT NOT NULL,
    is_admin INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id),
    stages TEXT NOT NULL,
    target_adapter TEXT NOT NULL,
    llm_provider TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS problems (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    user_id INTEGER NOT NULL,
    pid TEXT NOT NULL,
    display_id TEXT NOT NULL,
    source_adapter TEXT NOT NULL,
    target_adapter TEXT NOT NULL,
    state TEXT NOT NULL,
    retry_counts TEXT NOT NULL,
    last_error TEXT,
    real_id TEXT,
    uploaded_url TEXT,
    owner_worker TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_problems_task ON problems(task_id);
CREATE TABLE IF NOT EXISTS adapter_configs (
    user_id INTEGER NOT NULL,
    adapter_name TEXT NOT NULL,
    encrypted_blob TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, adapter_name)
);
CREATE TABLE IF NOT EXISTS provider_credentials (
    provider_id TEXT PRIMARY KEY,
    encrypted_blob TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS system_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS activity_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    ts TEXT NOT NULL
);
"#;

/// SQLite-backed repository.
pub struct SqliteRepository {
    pool: SqlitePool,
    cipher: CredentialCipher,
}

impl SqliteRepository {
    pub async fn connect(database_url: &str, cipher: CredentialCipher) -> Result<Self> {
        info!(url = database_url, "opening sqlite database");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open sqlite database: {e}"))?;

        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&pool).await?;
            }
        }
        Ok(Self { pool, cipher })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        salt: &str,
        is_admin: bool,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO users (username, password_hash, salt, is_admin, active, created_at)
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(username)
        .bind(password_hash)
        .bind(salt)
        .bind(is_admin as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get_user_by_name(&self, username: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, password_hash, salt, is_admin, active, created_at
             FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        row.map(UserRecord::try_from).transpose()
    }

    async fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, password_hash, salt, is_admin, active, created_at
             FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(UserRecord::try_from).transpose()
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (id, user_id, stages, target_adapter, llm_provider, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(task.user_id)
        .bind(serde_json::to_string(&task.stages)?)
        .bind(&task.target_adapter)
        .bind(&task.llm_provider)
        .bind(task.status.as_str())
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT id, user_id, stages, target_adapter, llm_provider, status, created_at, updated_at
             FROM tasks WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRecord::try_from).transpose()
    }

    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_tasks(
        &self,
        user_id: i64,
        filter: &TaskFilter,
        paging: Paging,
    ) -> Result<TaskListPage> {
        let status = filter.status.map(|s| s.as_str().to_string());
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE user_id = ? AND (? IS NULL OR status = ?)",
        )
        .bind(user_id)
        .bind(&status)
        .bind(&status)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT id, user_id, stages, target_adapter, llm_provider, status, created_at, updated_at
             FROM tasks
             WHERE user_id = ? AND (? IS NULL OR status = ?)
             ORDER BY created_at DESC
             LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(&status)
        .bind(&status)
        .bind(paging.per_page as i64)
        .bind(paging.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let tasks = rows
            .into_iter()
            .map(TaskRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(TaskListPage {
            tasks,
            total: total as u64,
            page: paging.page,
            per_page: paging.per_page,
        })
    }

    async fn delete_task(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM problems WHERE task_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_problem(&self, problem: &ProblemRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO problems (id, task_id, user_id, pid, display_id, source_adapter, target_adapter,
                                   state, retry_counts, last_error, real_id, uploaded_url, owner_worker,
                                   created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(problem.id.to_string())
        .bind(problem.task_id.to_string())
        .bind(problem.user_id)
        .bind(&problem.pid)
        .bind(&problem.display_id)
        .bind(&problem.source_adapter)
        .bind(&problem.target_adapter)
        .bind(problem.state.as_str())
        .bind(serde_json::to_string(&problem.retry_counts)?)
        .bind(
            problem
                .last_error
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&problem.real_id)
        .bind(&problem.uploaded_url)
        .bind(&problem.owner_worker)
        .bind(problem.created_at.to_rfc3339())
        .bind(problem.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_problem(&self, id: Uuid) -> Result<Option<ProblemRecord>> {
        let row = sqlx::query_as::<_, ProblemRow>(
            "SELECT id, task_id, user_id, pid, display_id, source_adapter, target_adapter,
                    state, retry_counts, last_error, real_id, uploaded_url, owner_worker,
                    created_at, updated_at
             FROM problems WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProblemRecord::try_from).transpose()
    }

    async fn problems_for_task(&self, task_id: Uuid) -> Result<Vec<ProblemRecord>> {
        let rows = sqlx::query_as::<_, ProblemRow>(
            "SELECT id, task_id, user_id, pid, display_id, source_adapter, target_adapter,
                    state, retry_counts, last_error, real_id, uploaded_url, owner_worker,
                    created_at, updated_at
             FROM problems WHERE task_id = ? ORDER BY created_at ASC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProblemRecord::try_from).collect()
    }

    async fn claim_problem(&self, id: Uuid, owner: &str) -> Result<bool> {
        // Atomic take-ownership, same shape as a claim UPDATE with a guard.
        let result = sqlx::query(
            "UPDATE problems SET owner_worker = ?, updated_at = ?
             WHERE id = ? AND owner_worker IS NULL",
        )
        .bind(owner)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_problem(&self, problem: &ProblemRecord, owner: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE problems
             SET state = ?, retry_counts = ?, last_error = ?, real_id = ?, uploaded_url = ?, updated_at = ?
             WHERE id = ? AND owner_worker = ?",
        )
        .bind(problem.state.as_str())
        .bind(serde_json::to_string(&problem.retry_counts)?)
        .bind(
            problem
                .last_error
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&problem.real_id)
        .bind(&problem.uploaded_url)
        .bind(Utc::now().to_rfc3339())
        .bind(problem.id.to_string())
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_problem(&self, id: Uuid, owner: &str) -> Result<()> {
        sqlx::query(
            "UPDATE problems SET owner_worker = NULL, updated_at = ?
             WHERE id = ? AND owner_worker = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_adapter_config(
        &self,
        user_id: i64,
        adapter: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<()> {
        let blob = self.cipher.encrypt_fields(fields)?;
        sqlx::query(
            "INSERT INTO adapter_configs (user_id, adapter_name, encrypted_blob, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, adapter_name) DO UPDATE SET encrypted_blob = excluded.encrypted_blob, updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(adapter)
        .bind(blob)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_adapter_config(
        &self,
        user_id: i64,
        adapter: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let blob: Option<String> = sqlx::query_scalar(
            "SELECT encrypted_blob FROM adapter_configs WHERE user_id = ? AND adapter_name = ?",
        )
        .bind(user_id)
        .bind(adapter)
        .fetch_optional(&self.pool)
        .await?;
        blob.map(|b| self.cipher.decrypt_fields(&b)).transpose()
    }

    async fn save_provider_credentials(
        &self,
        provider: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<()> {
        let blob = self.cipher.encrypt_fields(fields)?;
        sqlx::query(
            "INSERT INTO provider_credentials (provider_id, encrypted_blob, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(provider_id) DO UPDATE SET encrypted_blob = excluded.encrypted_blob, updated_at = excluded.updated_at",
        )
        .bind(provider)
        .bind(blob)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_provider_credentials(
        &self,
        provider: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let blob: Option<String> = sqlx::query_scalar(
            "SELECT encrypted_blob FROM provider_credentials WHERE provider_id = ?",
        )
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;
        blob.map(|b| self.cipher.decrypt_fields(&b)).transpose()
    }

    async fn get_system_config(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM system_config WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        value.map(|v| Ok(serde_json::from_str(&v)?)).transpose()
    }

    async fn set_system_config(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_config (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_activity(
        &self,
        user_id: i64,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        sqlx::query("INSERT INTO activity_log (user_id, kind, payload, ts) VALUES (?, ?, ?, ?)")
            .bind(user_id)
            .bind(kind)
            .bind(serde_json::to_string(&payload)?)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let states: Vec<String> = sqlx::query_scalar("SELECT state FROM problems")
            .fetch_all(&self.pool)
            .await?;
        Ok(count_queue(
            states.iter().filter_map(|s| ProblemState::parse(s)),
        ))
    }

    async fn system_stats(&self) -> Result<SystemStats> {
        let task_statuses: Vec<String> = sqlx::query_scalar("SELECT status FROM tasks")
            .fetch_all(&self.pool)
            .await?;
        let users_total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        let users_active: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE active = 1")
            .fetch_one(&self.pool)
            .await?;

        let mut stats = SystemStats {
            users_total: users_total as u64,
            users_active: users_active as u64,
            ..SystemStats::default()
        };
        for status in task_statuses.iter().filter_map(|s| TaskStatus::parse(s)) {
            stats.tasks_total += 1;
            match status {
                TaskStatus::Completed => stats.tasks_success += 1,
                TaskStatus::Running => stats.tasks_running += 1,
                TaskStatus::Failed | TaskStatus::Cancelled => stats.tasks_failed += 1,
                TaskStatus::Pending => stats.tasks_pending += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ojforge_models::{ProblemState, RetryCounts, StageSet};

    async fn repo() -> (tempfile::TempDir, SqliteRepository) {
        let tmp = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/test.db?mode=rwc", tmp.path().display());
        let repo = SqliteRepository::connect(&url, CredentialCipher::from_secret("t"))
            .await
            .unwrap();
        (tmp, repo)
    }

    #[tokio::test]
    async fn user_and_task_round_trip() {
        let (_tmp, repo) = repo().await;
        let user_id = repo.create_user("alice", "hash", "salt", false).await.unwrap();
        assert_eq!(
            repo.get_user_by_name("alice").await.unwrap().unwrap().id,
            user_id
        );

        let task = TaskRecord {
            id: Uuid::new_v4(),
            user_id,
            stages: StageSet::default(),
            target_adapter: "mock".into(),
            llm_provider: Some("deepseek".into()),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        repo.insert_task(&task).await.unwrap();
        repo.update_task_status(task.id, TaskStatus::Running)
            .await
            .unwrap();
        let loaded = repo.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert_eq!(loaded.stages, task.stages);
    }

    #[tokio::test]
    async fn problem_cas_requires_ownership() {
        let (_tmp, repo) = repo().await;
        let mut problem = ProblemRecord {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            user_id: 1,
            pid: "shsoj_1001".into(),
            display_id: "1001".into(),
            source_adapter: "shsoj".into(),
            target_adapter: "mock".into(),
            state: ProblemState::Pending,
            retry_counts: RetryCounts::default(),
            last_error: None,
            real_id: None,
            uploaded_url: None,
            owner_worker: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        repo.insert_problem(&problem).await.unwrap();

        assert!(repo.claim_problem(problem.id, "w1").await.unwrap());
        assert!(!repo.claim_problem(problem.id, "w2").await.unwrap());

        problem.state = ProblemState::Fetching;
        assert!(!repo.update_problem(&problem, "w2").await.unwrap());
        assert!(repo.update_problem(&problem, "w1").await.unwrap());

        let loaded = repo.get_problem(problem.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, ProblemState::Fetching);
        assert_eq!(loaded.owner_worker.as_deref(), Some("w1"));

        repo.release_problem(problem.id, "w1").await.unwrap();
        assert!(repo.claim_problem(problem.id, "w2").await.unwrap());
    }

    #[tokio::test]
    async fn adapter_config_is_encrypted_at_rest() {
        let (_tmp, repo) = repo().await;
        let mut fields = BTreeMap::new();
        fields.insert("token".to_string(), "super-secret".to_string());
        repo.save_adapter_config(7, "hydrooj", &fields).await.unwrap();

        let raw: String = sqlx::query_scalar(
            "SELECT encrypted_blob FROM adapter_configs WHERE user_id = 7 AND adapter_name = 'hydrooj'",
        )
        .fetch_one(repo.pool())
        .await
        .unwrap();
        assert!(!raw.contains("super-secret"));

        assert_eq!(
            repo.get_adapter_config(7, "hydrooj").await.unwrap(),
            Some(fields)
        );
    }
}
