//! Per-problem execution context handed to stage executors.

use crate::{EngineConfig, EventBus, Toolchain};
use ojforge_adapters::{Adapter, AdapterCtx};
use ojforge_concurrency::GatePool;
use ojforge_llm::LlmPool;
use ojforge_models::{EventKind, PipelineError, PipelineResult, ProgressEvent, Stage};
use ojforge_workspace::Workspace;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Everything a stage executor needs. Stages read and write the workspace
/// and talk to collaborators; the runner owns all status persistence.
pub struct ProblemCtx {
    pub user_id: i64,
    pub task_id: Uuid,
    /// Normalized pid, e.g. `cf_1234A`.
    pub pid: String,
    /// Short id the source judge understands.
    pub display_id: String,
    pub workspace: Workspace,
    /// Absent when the source judge has no registered adapter; fetch then
    /// fails, but cached statements keep downstream stages runnable.
    pub source: Option<Arc<dyn Adapter>>,
    pub target: Arc<dyn Adapter>,
    pub adapter_ctx: AdapterCtx,
    pub llm: Arc<LlmPool>,
    pub gates: Arc<GatePool>,
    pub toolchain: Arc<dyn Toolchain>,
    pub cancel: CancellationToken,
    pub events: EventBus,
    pub config: EngineConfig,
}

impl ProblemCtx {
    pub fn check_cancelled(&self) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Cancellable sleep; errors out as soon as the token fires.
    pub async fn sleep(&self, duration: std::time::Duration) -> PipelineResult<()> {
        if duration.is_zero() {
            return self.check_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
        }
    }

    /// Append to the stage log and fan the line out as a progress event.
    pub async fn log(&self, stage: Stage, line: impl AsRef<str>) {
        let line = line.as_ref();
        if let Err(e) = self.workspace.append_stage_log(stage, line).await {
            warn!(pid = %self.pid, error = %e, "stage log write failed");
        }
        self.events.publish(
            ProgressEvent::new(EventKind::TaskProgress, self.task_id)
                .with_problem(self.pid.clone())
                .with_stage(stage)
                .with_payload(serde_json::json!({ "detail": line })),
        );
    }

    pub fn emit(&self, event: ProgressEvent) {
        self.events.publish(event);
    }
}
