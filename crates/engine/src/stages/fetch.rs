//! Fetch (F): pull the statement from the source judge and persist it.

use crate::stages::StageOutcome;
use crate::ProblemCtx;
use ojforge_models::{PipelineError, PipelineResult, Stage};

pub async fn run(ctx: &ProblemCtx) -> PipelineResult<StageOutcome> {
    ctx.check_cancelled()?;
    let source = ctx.source.as_ref().ok_or_else(|| {
        PipelineError::Internal(format!(
            "no adapter registered for source judge of {}",
            ctx.pid
        ))
    })?;

    ctx.log(Stage::Fetch, format!("fetching via {}", source.name()))
        .await;
    let statement = source.fetch_problem(&ctx.adapter_ctx, &ctx.display_id).await?;
    ctx.check_cancelled()?;

    ctx.workspace
        .write_statement(&statement)
        .await
        .map_err(|e| PipelineError::Internal(format!("persisting statement: {e}")))?;

    ctx.log(
        Stage::Fetch,
        format!(
            "statement saved: \"{}\", {} samples, {}ms/{}MB",
            statement.title,
            statement.samples.len(),
            statement.limits.time_ms,
            statement.limits.memory_mb
        ),
    )
    .await;
    Ok(StageOutcome::Done)
}
