//! Database row types for the SQLite backend.

use crate::UserRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ojforge_models::{
    LastError, ProblemRecord, ProblemState, RetryCounts, StageSet, TaskRecord, TaskStatus,
};
use sqlx::FromRow;
use uuid::Uuid;

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp: {s}"))?
        .with_timezone(&Utc))
}

#[derive(Debug, FromRow)]
pub(crate) struct UserRow {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub is_admin: i64,
    pub active: i64,
    pub created_at: String,
}

impl TryFrom<UserRow> for UserRecord {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(UserRecord {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            salt: row.salt,
            is_admin: row.is_admin != 0,
            active: row.active != 0,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct TaskRow {
    pub id: String,
    pub user_id: i64,
    pub stages: String,
    pub target_adapter: String,
    pub llm_provider: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = anyhow::Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        let stages: StageSet = serde_json::from_str(&row.stages)?;
        Ok(TaskRecord {
            id: Uuid::parse_str(&row.id)?,
            user_id: row.user_id,
            stages,
            target_adapter: row.target_adapter,
            llm_provider: row.llm_provider,
            status: TaskStatus::parse(&row.status)
                .with_context(|| format!("bad task status: {}", row.status))?,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ProblemRow {
    pub id: String,
    pub task_id: String,
    pub user_id: i64,
    pub pid: String,
    pub display_id: String,
    pub source_adapter: String,
    pub target_adapter: String,
    pub state: String,
    pub retry_counts: String,
    pub last_error: Option<String>,
    pub real_id: Option<String>,
    pub uploaded_url: Option<String>,
    pub owner_worker: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<ProblemRow> for ProblemRecord {
    type Error = anyhow::Error;

    fn try_from(row: ProblemRow) -> Result<Self> {
        let retry_counts: RetryCounts = serde_json::from_str(&row.retry_counts)?;
        let last_error: Option<LastError> = row
            .last_error
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(ProblemRecord {
            id: Uuid::parse_str(&row.id)?,
            task_id: Uuid::parse_str(&row.task_id)?,
            user_id: row.user_id,
            pid: row.pid,
            display_id: row.display_id,
            source_adapter: row.source_adapter,
            target_adapter: row.target_adapter,
            state: ProblemState::parse(&row.state)
                .with_context(|| format!("bad problem state: {}", row.state))?,
            retry_counts,
            last_error,
            real_id: row.real_id,
            uploaded_url: row.uploaded_url,
            owner_worker: row.owner_worker,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}
