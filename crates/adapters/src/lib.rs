//! Judge adapter contract and registry.
//!
//! Adapters are shared, stateless singletons: every call carries an
//! [`AdapterCtx`] with the caller's user id, and credentials are re-read
//! from the persistence adapter inside each call. Adapters hold protocol
//! state only (HTTP clients), never tenant state; there is deliberately no
//! "configure" entry point.

use async_trait::async_trait;
use ojforge_models::{PipelineError, PipelineResult, Statement, Verdict};
use ojforge_storage::Repository;
use ojforge_workspace::Workspace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod mock;
mod registry;

pub use registry::{AdapterRegistry, AdapterSummary};

/// A named operation an adapter may implement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FetchProblem,
    UploadData,
    SubmitSolution,
    JudgeStatus,
    BatchFetch,
    ListTraining,
    ProvideSolution,
}

/// Field kind for the adapter config UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Password,
    Number,
    Bool,
}

/// One entry of an adapter's credential schema, in UI order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigField {
    pub field: String,
    pub kind: FieldKind,
    pub required: bool,
    pub help: String,
}

impl ConfigField {
    pub fn new(field: &str, kind: FieldKind, required: bool, help: &str) -> Self {
        Self {
            field: field.into(),
            kind,
            required,
            help: help.into(),
        }
    }
}

/// Per-call context. Carries the caller's identity and the repository the
/// adapter reads its per-user configuration from.
#[derive(Clone)]
pub struct AdapterCtx {
    pub user_id: i64,
    repo: Arc<dyn Repository>,
}

impl AdapterCtx {
    pub fn new(user_id: i64, repo: Arc<dyn Repository>) -> Self {
        Self { user_id, repo }
    }

    /// Fetches the caller's credentials for `adapter`, fresh on every call.
    pub async fn config(&self, adapter: &str) -> PipelineResult<BTreeMap<String, String>> {
        self.repo
            .get_adapter_config(self.user_id, adapter)
            .await
            .map_err(|e| PipelineError::Internal(format!("loading adapter config: {e}")))?
            .ok_or_else(|| {
                PipelineError::Auth(format!(
                    "no {adapter} credentials configured for user {}",
                    self.user_id
                ))
            })
    }
}

/// Upload response from a target judge. `real_id` may be absent when the
/// judge answers 200 with a non-JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub real_id: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// Opaque handle to a submitted solution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionHandle {
    pub id: String,
}

/// Judge status for a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeReport {
    pub verdict: Verdict,
    #[serde(default)]
    pub logs: Option<String>,
}

/// Selector for training-list queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingSelector {
    Tag(String),
    Range { from: u64, to: u64 },
}

fn unsupported(adapter: &str, what: &str) -> PipelineError {
    PipelineError::Internal(format!("adapter {adapter} does not implement {what}"))
}

/// Contract any judge adapter must honor. Default method bodies reject the
/// call; adapters override exactly the capabilities they declare.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;
    fn display_name(&self) -> &str;
    fn version(&self) -> &str {
        "1.0"
    }
    fn capabilities(&self) -> Vec<Capability>;
    fn config_schema(&self) -> Vec<ConfigField>;

    async fn fetch_problem(&self, _ctx: &AdapterCtx, _pid: &str) -> PipelineResult<Statement> {
        Err(unsupported(self.name(), "fetch_problem"))
    }

    async fn upload_data(
        &self,
        _ctx: &AdapterCtx,
        _workspace: &Workspace,
    ) -> PipelineResult<UploadOutcome> {
        Err(unsupported(self.name(), "upload_data"))
    }

    /// Exact-title lookup on the target judge. Titles are compared after
    /// whitespace normalization, case-sensitively.
    async fn search_by_title(
        &self,
        _ctx: &AdapterCtx,
        _title: &str,
    ) -> PipelineResult<Option<String>> {
        Err(unsupported(self.name(), "search_by_title"))
    }

    async fn submit_solution(
        &self,
        _ctx: &AdapterCtx,
        _real_id: &str,
        _code: &str,
        _lang: &str,
    ) -> PipelineResult<SubmissionHandle> {
        Err(unsupported(self.name(), "submit_solution"))
    }

    async fn judge_status(
        &self,
        _ctx: &AdapterCtx,
        _handle: &SubmissionHandle,
    ) -> PipelineResult<JudgeReport> {
        Err(unsupported(self.name(), "judge_status"))
    }

    async fn list_training_ids(
        &self,
        _ctx: &AdapterCtx,
        _selector: &TrainingSelector,
    ) -> PipelineResult<Vec<String>> {
        Err(unsupported(self.name(), "list_training_ids"))
    }

    async fn provide_solution(
        &self,
        _ctx: &AdapterCtx,
        _pid: &str,
    ) -> PipelineResult<Option<String>> {
        Err(unsupported(self.name(), "provide_solution"))
    }

    /// URL of an uploaded problem, built from the caller's config unless the
    /// adapter declares its own template.
    fn problem_url(&self, config: &BTreeMap<String, String>, real_id: &str) -> Option<String> {
        let base = config.get("base_url")?.trim_end_matches('/');
        let domain = config.get("domain")?;
        Some(format!("{base}/d/{domain}/p/{real_id}"))
    }
}
