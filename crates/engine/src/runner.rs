//! Per-problem state machine driver.
//!
//! Owns all status persistence for a problem while it runs: claims the row,
//! advances the stage marker only after the stage's workspace artifacts are
//! on disk, applies the skip / retry / abort policy, and emits progress
//! events in state-machine order.

use crate::stages::{self, StageOutcome};
use crate::{backoff, EngineConfig, ProblemCtx};
use ojforge_models::{
    EventKind, LastError, PipelineError, PipelineResult, ProblemRecord, ProblemState,
    ProgressEvent, Receipt, Stage, StageSet, Verdict,
};
use ojforge_storage::Repository;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

enum StageValue {
    Plain(StageOutcome),
    Uploaded(Receipt),
    Solved(Verdict),
}

pub struct Runner {
    repo: Arc<dyn Repository>,
    config: EngineConfig,
}

impl Runner {
    pub fn new(repo: Arc<dyn Repository>, config: EngineConfig) -> Self {
        Self { repo, config }
    }

    /// Drives one problem to a terminal state and returns the final record.
    /// The caller holds the admission permits; this claims row ownership.
    pub async fn run_problem(
        &self,
        record: ProblemRecord,
        ctx: &ProblemCtx,
        stages: StageSet,
    ) -> ProblemRecord {
        let problem_id = record.id;
        let owner = format!("runner-{}", Uuid::new_v4());
        match self.repo.claim_problem(problem_id, &owner).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(pid = %record.pid, "problem already owned by another runner");
                return record;
            }
            Err(e) => {
                warn!(pid = %record.pid, error = %e, "claim failed");
                return record;
            }
        }

        let fallback = record.clone();
        let limit = Duration::from_secs(ctx.gates.config().task_timeout_secs);
        let outcome = tokio::time::timeout(limit, self.drive(record, ctx, stages, &owner)).await;

        let finished = match outcome {
            Ok(record) => record,
            Err(_elapsed) => self.mark_timed_out(fallback, ctx, &owner).await,
        };
        if let Err(e) = self.repo.release_problem(problem_id, &owner).await {
            warn!(error = %e, "releasing problem row failed");
        }
        finished
    }

    /// The wall-clock limit elapsed: the future was dropped at a suspension
    /// point, so the persisted state still names the running stage. Fail
    /// the problem there.
    async fn mark_timed_out(
        &self,
        fallback: ProblemRecord,
        ctx: &ProblemCtx,
        owner: &str,
    ) -> ProblemRecord {
        let mut record = match self.repo.get_problem(fallback.id).await {
            Ok(Some(current)) => current,
            _ => fallback,
        };
        let stage = match record.state {
            ProblemState::Fetching => Stage::Fetch,
            ProblemState::Generating => Stage::Generate,
            ProblemState::Uploading => Stage::Upload,
            _ => Stage::Solve,
        };
        let err = PipelineError::Timeout(format!(
            "problem exceeded {}s wall clock",
            ctx.gates.config().task_timeout_secs
        ));
        record.state = ProblemState::failed(stage);
        record.last_error = Some(LastError {
            kind: err.kind(),
            message: err.to_string(),
        });
        let _ = self.repo.update_problem(&record, owner).await;
        self.emit_terminal(ctx, &record);
        record
    }

    async fn drive(
        &self,
        mut record: ProblemRecord,
        ctx: &ProblemCtx,
        stages: StageSet,
        owner: &str,
    ) -> ProblemRecord {
        let mut ran_upload = false;

        for stage in Stage::ALL {
            if !stages.contains(stage) {
                continue;
            }
            if ctx.cancel.is_cancelled() {
                return self.finish_cancelled(record, ctx, owner).await;
            }

            // Skip computation consults the workspace before every stage, so
            // a fully-cached problem never touches an adapter or the LLM.
            match self.skip_satisfied(ctx, stage, &mut record).await {
                Ok(true) => {
                    ctx.log(stage, "skipped, workspace already satisfies this stage")
                        .await;
                    continue;
                }
                Ok(false) => {}
                Err(e) => return self.finish_failed(record, ctx, stage, e, owner).await,
            }

            record.state = ProblemState::running(stage);
            if let Err(e) = self.persist(&record, owner).await {
                return self.finish_failed(record, ctx, stage, e, owner).await;
            }
            ctx.emit(
                ProgressEvent::new(EventKind::TaskProgress, ctx.task_id)
                    .with_problem(record.pid.clone())
                    .with_stage(stage)
                    .with_status("running"),
            );

            // Outer-to-inner gate order: stage gate here, llm gates inside
            // the pool.
            let _stage_permit = match stage.gate_name() {
                Some(name) => match ctx.gates.acquire(name, &ctx.cancel).await {
                    Ok(permit) => Some(permit),
                    Err(PipelineError::Cancelled) => {
                        return self.finish_cancelled(record, ctx, owner).await
                    }
                    Err(e) => return self.finish_failed(record, ctx, stage, e, owner).await,
                },
                None => None,
            };

            match self.execute_with_retry(&mut record, ctx, stage).await {
                Ok(StageValue::Uploaded(receipt)) => {
                    record.real_id = Some(receipt.real_id.clone());
                    record.uploaded_url = Some(receipt.url.clone());
                    ran_upload = true;
                }
                Ok(StageValue::Plain(StageOutcome::DoneWithWarning(warning))) => {
                    ctx.log(stage, format!("stage succeeded with warning: {warning}"))
                        .await;
                }
                Ok(StageValue::Solved(verdict)) => {
                    ctx.log(stage, format!("judge verdict {verdict:?}")).await;
                }
                Ok(StageValue::Plain(StageOutcome::Done)) => {}
                Err(PipelineError::Cancelled) => {
                    return self.finish_cancelled(record, ctx, owner).await
                }
                Err(e) => return self.finish_failed(record, ctx, stage, e, owner).await,
            }

            if stage == Stage::Upload && ran_upload && stages.contains(Stage::Solve) {
                // Give the target a moment to index the fresh problem.
                if ctx.sleep(self.config.post_upload_settle).await.is_err() {
                    return self.finish_cancelled(record, ctx, owner).await;
                }
            }
        }

        record.state = ProblemState::Completed;
        record.last_error = None;
        if let Err(e) = self.persist(&record, owner).await {
            warn!(pid = %record.pid, error = %e, "final persist failed");
        }
        info!(pid = %record.pid, "problem completed");
        self.emit_terminal(ctx, &record);
        record
    }

    async fn execute_with_retry(
        &self,
        record: &mut ProblemRecord,
        ctx: &ProblemCtx,
        stage: Stage,
    ) -> PipelineResult<StageValue> {
        let max_attempts = self.config.stage_max_attempts;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > 1 {
                record.retry_counts.bump(stage);
            }

            let result = self.execute_stage(record, ctx, stage).await;
            match result {
                Ok(value) => return Ok(value),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) if e.is_retryable() => {
                    if attempt >= max_attempts {
                        warn!(pid = %record.pid, %stage, attempts = attempt, "stage exhausted");
                        return Err(PipelineError::StageExhausted(stage, attempt));
                    }
                    let delay = backoff::retry_delay(self.config.backoff_base, attempt);
                    ctx.log(
                        stage,
                        format!(
                            "attempt {attempt} hit a retryable error ({e}), retrying in {:?}",
                            delay
                        ),
                    )
                    .await;
                    ctx.sleep(delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute_stage(
        &self,
        record: &ProblemRecord,
        ctx: &ProblemCtx,
        stage: Stage,
    ) -> PipelineResult<StageValue> {
        match stage {
            Stage::Fetch => stages::fetch::run(ctx).await.map(StageValue::Plain),
            Stage::Generate => stages::generate::run(ctx).await.map(StageValue::Plain),
            Stage::Upload => stages::upload::run(ctx).await.map(StageValue::Uploaded),
            Stage::Solve => {
                let real_id = match &record.real_id {
                    Some(id) => id.clone(),
                    None => match ctx.workspace.get_upload_receipt(ctx.target.name()).await {
                        Ok(Some(receipt)) => receipt.real_id,
                        _ => {
                            return Err(PipelineError::BadData(
                                "no uploaded problem id to solve against".into(),
                            ))
                        }
                    },
                };
                stages::solve::run(ctx, &real_id).await.map(StageValue::Solved)
            }
        }
    }

    async fn skip_satisfied(
        &self,
        ctx: &ProblemCtx,
        stage: Stage,
        record: &mut ProblemRecord,
    ) -> PipelineResult<bool> {
        Ok(match stage {
            Stage::Fetch => ctx.workspace.has_statement().await,
            Stage::Generate => ctx.workspace.has_generated_data().await,
            Stage::Upload => {
                match ctx
                    .workspace
                    .get_upload_receipt(ctx.target.name())
                    .await
                    .map_err(|e| PipelineError::Internal(format!("reading receipt: {e}")))?
                {
                    Some(receipt) => {
                        record.real_id = Some(receipt.real_id);
                        record.uploaded_url = Some(receipt.url);
                        true
                    }
                    None => false,
                }
            }
            Stage::Solve => ctx.workspace.has_accepted_solution().await,
        })
    }

    async fn persist(&self, record: &ProblemRecord, owner: &str) -> PipelineResult<()> {
        match self.repo.update_problem(record, owner).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(PipelineError::Internal(
                "lost ownership of problem row".into(),
            )),
            Err(e) => Err(PipelineError::Internal(format!("persisting problem: {e}"))),
        }
    }

    async fn finish_cancelled(
        &self,
        mut record: ProblemRecord,
        ctx: &ProblemCtx,
        owner: &str,
    ) -> ProblemRecord {
        record.state = ProblemState::Cancelled;
        record.last_error = Some(LastError {
            kind: PipelineError::Cancelled.kind(),
            message: "cancelled".into(),
        });
        if let Err(e) = self.persist(&record, owner).await {
            warn!(pid = %record.pid, error = %e, "persisting cancellation failed");
        }
        info!(pid = %record.pid, "problem cancelled");
        self.emit_terminal(ctx, &record);
        record
    }

    async fn finish_failed(
        &self,
        mut record: ProblemRecord,
        ctx: &ProblemCtx,
        stage: Stage,
        error: PipelineError,
        owner: &str,
    ) -> ProblemRecord {
        warn!(pid = %record.pid, %stage, error = %error, "stage failed");
        record.state = ProblemState::failed(stage);
        record.last_error = Some(LastError {
            kind: error.kind(),
            message: error.to_string(),
        });
        if let Err(e) = self.persist(&record, owner).await {
            warn!(pid = %record.pid, error = %e, "persisting failure failed");
        }
        ctx.log(stage, format!("stage failed: {error}")).await;
        self.emit_terminal(ctx, &record);
        record
    }

    fn emit_terminal(&self, ctx: &ProblemCtx, record: &ProblemRecord) {
        ctx.emit(
            ProgressEvent::new(EventKind::TaskProblemCompleted, ctx.task_id)
                .with_problem(record.pid.clone())
                .with_status(record.state.as_str()),
        );
    }
}
