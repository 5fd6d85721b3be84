use crate::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate status of a task, derived from its problems.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        Some(match s {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => return None,
        })
    }
}

/// Which pipeline stages a task enables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageSet {
    pub fetch: bool,
    pub generate: bool,
    pub upload: bool,
    pub solve: bool,
}

impl Default for StageSet {
    fn default() -> Self {
        Self {
            fetch: true,
            generate: true,
            upload: true,
            solve: true,
        }
    }
}

impl StageSet {
    pub fn contains(&self, stage: Stage) -> bool {
        match stage {
            Stage::Fetch => self.fetch,
            Stage::Generate => self.generate,
            Stage::Upload => self.upload,
            Stage::Solve => self.solve,
        }
    }

    /// Enabling upload implies solve unless the caller cleared it explicitly.
    /// `solve_cleared` records that explicit choice.
    pub fn normalized(mut self, solve_cleared: bool) -> Self {
        if self.upload && !self.solve && !solve_cleared {
            self.solve = true;
        }
        self
    }

    pub fn enabled(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| self.contains(*s))
            .collect()
    }
}

/// One problem reference inside a task submission: the raw user string plus
/// an optional source adapter hint that bypasses auto-detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawProblemRef {
    pub raw: String,
    #[serde(default)]
    pub source_adapter: Option<String>,
}

/// Batch submission accepted by the task service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub problems: Vec<RawProblemRef>,
    #[serde(default)]
    pub stages: StageSet,
    /// Caller explicitly disabled solve alongside upload.
    #[serde(default)]
    pub solve_cleared: bool,
    pub target_adapter: String,
    #[serde(default)]
    pub llm_provider: Option<String>,
}

/// Persisted task envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub user_id: i64,
    pub stages: StageSet,
    pub target_adapter: String,
    pub llm_provider: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filters for task listing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub search: Option<String>,
}

/// Offset/limit paging.
#[derive(Debug, Clone, Copy)]
pub struct Paging {
    pub page: u32,
    pub per_page: u32,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}

impl Paging {
    pub fn offset(&self) -> u32 {
        self.page.saturating_sub(1) * self.per_page
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskListPage {
    pub tasks: Vec<TaskRecord>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_implies_solve() {
        let set = StageSet {
            fetch: true,
            generate: true,
            upload: true,
            solve: false,
        };
        assert!(set.normalized(false).solve);
        assert!(!set.normalized(true).solve);
    }
}
