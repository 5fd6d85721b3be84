use crate::{Stage, Verdict};
use thiserror::Error;

/// Errors the pipeline core distinguishes.
///
/// The runner classifies these as retryable or terminal; the task service
/// aggregates them without rewriting.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("upstream server error: {0}")]
    Upstream(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("bad data: {0}")]
    BadData(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("duplicate problem on target: {0}")]
    Duplicate(String),

    #[error("insufficient generated cases: {got}/{want}")]
    GenInsufficient { got: usize, want: usize },

    #[error("solution rejected with verdict {0:?}")]
    SolveRejected(Verdict),

    #[error("upload response carried no problem id")]
    UploadNoId,

    #[error("stage {0} exhausted after {1} attempts")]
    StageExhausted(Stage, u32),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the runner may automatically retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientNetwork(_)
                | PipelineError::RateLimited(_)
                | PipelineError::Timeout(_)
                | PipelineError::Upstream(_)
        )
    }

    /// Stable machine-readable kind string, persisted in `last_error`.
    pub fn kind(&self) -> String {
        match self {
            PipelineError::TransientNetwork(_) => "transient_network".into(),
            PipelineError::RateLimited(_) => "rate_limited".into(),
            PipelineError::Timeout(_) => "timeout".into(),
            PipelineError::Upstream(_) => "5xx".into(),
            PipelineError::Auth(_) => "auth".into(),
            PipelineError::NotFound(_) => "not_found".into(),
            PipelineError::Parse(_) => "parse".into(),
            PipelineError::BadData(_) => "bad_data".into(),
            PipelineError::Forbidden(_) => "forbidden".into(),
            PipelineError::Duplicate(_) => "duplicate".into(),
            PipelineError::GenInsufficient { .. } => "gen_insufficient".into(),
            PipelineError::SolveRejected(v) => match v {
                Verdict::WrongAnswer => "solve_wrong_answer".into(),
                Verdict::CompileError => "solve_compile".into(),
                _ => "solve_runtime".into(),
            },
            PipelineError::UploadNoId => "upload_no_id".into(),
            PipelineError::StageExhausted(stage, _) => format!("stage_exhausted({stage})"),
            PipelineError::Cancelled => "cancelled".into(),
            PipelineError::Internal(_) => "internal".into(),
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::TransientNetwork(_)
            | PipelineError::RateLimited(_)
            | PipelineError::Timeout(_)
            | PipelineError::Upstream(_) => "transport",
            PipelineError::Auth(_)
            | PipelineError::NotFound(_)
            | PipelineError::Parse(_)
            | PipelineError::BadData(_)
            | PipelineError::Forbidden(_) => "input",
            PipelineError::Duplicate(_)
            | PipelineError::GenInsufficient { .. }
            | PipelineError::SolveRejected(_)
            | PipelineError::UploadNoId
            | PipelineError::StageExhausted(..) => "semantic",
            PipelineError::Cancelled | PipelineError::Internal(_) => "infrastructure",
        }
    }
}

/// Result alias used throughout the engine crates.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(PipelineError::TransientNetwork("reset".into()).is_retryable());
        assert!(PipelineError::RateLimited("429".into()).is_retryable());
        assert!(!PipelineError::Auth("bad cookie".into()).is_retryable());
        assert!(!PipelineError::SolveRejected(Verdict::WrongAnswer).is_retryable());
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(
            PipelineError::StageExhausted(Stage::Generate, 3).kind(),
            "stage_exhausted(gen)"
        );
        assert_eq!(
            PipelineError::SolveRejected(Verdict::TimeLimit).kind(),
            "solve_runtime"
        );
        assert_eq!(PipelineError::UploadNoId.kind(), "upload_no_id");
    }
}
