use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the four pipeline stages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Generate,
    Upload,
    Solve,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Fetch, Stage::Generate, Stage::Upload, Stage::Solve];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Generate => "gen",
            Stage::Upload => "upload",
            Stage::Solve => "solve",
        }
    }

    /// Name of the concurrency gate guarding this stage. Generate has no
    /// stage gate of its own; its parallelism is bounded by the LLM gates.
    pub fn gate_name(&self) -> Option<&'static str> {
        match self {
            Stage::Fetch => Some("stage.fetch"),
            Stage::Generate => None,
            Stage::Upload => Some("stage.upload"),
            Stage::Solve => Some("stage.solve"),
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "fetch" => Some(Stage::Fetch),
            "gen" | "generate" => Some(Stage::Generate),
            "upload" => Some(Stage::Upload),
            "solve" => Some(Stage::Solve),
            _ => None,
        }
    }

    /// Stages from `self` (inclusive) to the end of the pipeline.
    pub fn and_downstream(&self) -> &'static [Stage] {
        match self {
            Stage::Fetch => &Stage::ALL,
            Stage::Generate => &[Stage::Generate, Stage::Upload, Stage::Solve],
            Stage::Upload => &[Stage::Upload, Stage::Solve],
            Stage::Solve => &[Stage::Solve],
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-problem state machine position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProblemState {
    Pending,
    Fetching,
    Generating,
    Uploading,
    Solving,
    Completed,
    FailedFetch,
    FailedGen,
    FailedUpload,
    FailedSolve,
    Cancelled,
}

impl ProblemState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProblemState::Completed
                | ProblemState::FailedFetch
                | ProblemState::FailedGen
                | ProblemState::FailedUpload
                | ProblemState::FailedSolve
                | ProblemState::Cancelled
        )
    }

    pub fn running(stage: Stage) -> ProblemState {
        match stage {
            Stage::Fetch => ProblemState::Fetching,
            Stage::Generate => ProblemState::Generating,
            Stage::Upload => ProblemState::Uploading,
            Stage::Solve => ProblemState::Solving,
        }
    }

    pub fn failed(stage: Stage) -> ProblemState {
        match stage {
            Stage::Fetch => ProblemState::FailedFetch,
            Stage::Generate => ProblemState::FailedGen,
            Stage::Upload => ProblemState::FailedUpload,
            Stage::Solve => ProblemState::FailedSolve,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemState::Pending => "pending",
            ProblemState::Fetching => "fetching",
            ProblemState::Generating => "generating",
            ProblemState::Uploading => "uploading",
            ProblemState::Solving => "solving",
            ProblemState::Completed => "completed",
            ProblemState::FailedFetch => "failed_fetch",
            ProblemState::FailedGen => "failed_gen",
            ProblemState::FailedUpload => "failed_upload",
            ProblemState::FailedSolve => "failed_solve",
            ProblemState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<ProblemState> {
        Some(match s {
            "pending" => ProblemState::Pending,
            "fetching" => ProblemState::Fetching,
            "generating" => ProblemState::Generating,
            "uploading" => ProblemState::Uploading,
            "solving" => ProblemState::Solving,
            "completed" => ProblemState::Completed,
            "failed_fetch" => ProblemState::FailedFetch,
            "failed_gen" => ProblemState::FailedGen,
            "failed_upload" => ProblemState::FailedUpload,
            "failed_solve" => ProblemState::FailedSolve,
            "cancelled" => ProblemState::Cancelled,
            _ => return None,
        })
    }
}

/// Verdict reported by a target judge for a submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pending,
    Accepted,
    WrongAnswer,
    RuntimeError,
    TimeLimit,
    MemoryLimit,
    CompileError,
}

impl Verdict {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Verdict::Pending)
    }
}

/// Per-stage retry counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryCounts {
    pub fetch: u32,
    pub gen: u32,
    pub upload: u32,
    pub solve: u32,
}

impl RetryCounts {
    pub fn get(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Fetch => self.fetch,
            Stage::Generate => self.gen,
            Stage::Upload => self.upload,
            Stage::Solve => self.solve,
        }
    }

    pub fn bump(&mut self, stage: Stage) {
        match stage {
            Stage::Fetch => self.fetch += 1,
            Stage::Generate => self.gen += 1,
            Stage::Upload => self.upload += 1,
            Stage::Solve => self.solve += 1,
        }
    }

    pub fn reset_from(&mut self, stage: Stage) {
        for s in stage.and_downstream() {
            match s {
                Stage::Fetch => self.fetch = 0,
                Stage::Generate => self.gen = 0,
                Stage::Upload => self.upload = 0,
                Stage::Solve => self.solve = 0,
            }
        }
    }
}

/// Most recent terminal error recorded for a problem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastError {
    pub kind: String,
    pub message: String,
}

/// A single unit of work within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub user_id: i64,
    /// Normalized id, e.g. `cf_1234A`. Also the workspace directory key.
    pub pid: String,
    /// Short id shown to users, e.g. `1234A`.
    pub display_id: String,
    pub source_adapter: String,
    pub target_adapter: String,
    pub state: ProblemState,
    pub retry_counts: RetryCounts,
    pub last_error: Option<LastError>,
    /// Id the target judge assigned on upload.
    pub real_id: Option<String>,
    pub uploaded_url: Option<String>,
    /// Identity of the runner currently owning this row (CAS guard).
    pub owner_worker: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        for s in [
            ProblemState::Pending,
            ProblemState::Solving,
            ProblemState::FailedUpload,
            ProblemState::Cancelled,
        ] {
            assert_eq!(ProblemState::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn downstream_reset_spares_upstream() {
        let mut counts = RetryCounts {
            fetch: 2,
            gen: 1,
            upload: 3,
            solve: 1,
        };
        counts.reset_from(Stage::Upload);
        assert_eq!(counts.fetch, 2);
        assert_eq!(counts.gen, 1);
        assert_eq!(counts.upload, 0);
        assert_eq!(counts.solve, 0);
    }
}
