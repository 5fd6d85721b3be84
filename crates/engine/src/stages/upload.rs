//! Upload (U): push generated data to the target judge, idempotently.
//!
//! A title search guards every upload: if the target already has a problem
//! with this (whitespace-normalized) title, the stage completes with the
//! existing id and creates nothing. A 200-with-no-id upload response falls
//! back to a second title search, then to a previously persisted receipt.

use crate::ProblemCtx;
use chrono::Utc;
use ojforge_models::{normalize_title, PipelineError, PipelineResult, Receipt, Stage};

pub async fn run(ctx: &ProblemCtx) -> PipelineResult<Receipt> {
    ctx.check_cancelled()?;
    let statement = ctx.workspace.read_statement().await?;
    if !ctx.workspace.has_generated_data().await {
        return Err(PipelineError::BadData(
            "no generated data in workspace".into(),
        ));
    }

    let title = normalize_title(&statement.title);
    let target = &ctx.target;

    ctx.log(Stage::Upload, format!("checking {} for \"{title}\"", target.name()))
        .await;
    if let Some(real_id) = target.search_by_title(&ctx.adapter_ctx, &title).await? {
        ctx.log(
            Stage::Upload,
            format!("target already has this problem as {real_id}, skipping upload"),
        )
        .await;
        return finish(ctx, real_id).await;
    }

    ctx.check_cancelled()?;
    ctx.log(Stage::Upload, "uploading generated data").await;
    let outcome = target.upload_data(&ctx.adapter_ctx, &ctx.workspace).await?;

    let real_id = match outcome.real_id {
        Some(id) => id,
        None => {
            // Some judges answer 200 with a non-JSON body.
            ctx.log(Stage::Upload, "no id in upload response, searching by title")
                .await;
            match target.search_by_title(&ctx.adapter_ctx, &title).await? {
                Some(id) => id,
                None => match ctx.workspace.get_upload_receipt(target.name()).await {
                    Ok(Some(previous)) => previous.real_id,
                    _ => return Err(PipelineError::UploadNoId),
                },
            }
        }
    };

    finish(ctx, real_id).await
}

async fn finish(ctx: &ProblemCtx, real_id: String) -> PipelineResult<Receipt> {
    let config = ctx.adapter_ctx.config(ctx.target.name()).await?;
    let url = ctx
        .target
        .problem_url(&config, &real_id)
        .ok_or_else(|| {
            PipelineError::Internal(format!(
                "adapter {} config lacks base_url/domain for URL construction",
                ctx.target.name()
            ))
        })?;

    let receipt = Receipt {
        adapter: ctx.target.name().to_string(),
        real_id,
        url,
        uploaded_at: Utc::now(),
    };
    // Receipt lands in the workspace before the status row advances.
    ctx.workspace
        .put_upload_receipt(&receipt)
        .await
        .map_err(|e| PipelineError::Internal(format!("persisting receipt: {e}")))?;
    ctx.log(
        Stage::Upload,
        format!("uploaded as {} ({})", receipt.real_id, receipt.url),
    )
    .await;
    Ok(receipt)
}
