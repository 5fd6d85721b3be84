//! Solve (S): obtain a reference solution, submit it to the uploaded
//! problem, and poll for a verdict.
//!
//! Solution sources, first hit wins: workspace `sol/solution.*`, the
//! adapter's official solution, the LLM solution endpoint.

use crate::stages::extract_code_block;
use crate::ProblemCtx;
use ojforge_llm::{CallOptions, LlmEndpoint};
use ojforge_models::{PipelineError, PipelineResult, Stage, Verdict};
use std::time::Instant;

pub async fn run(ctx: &ProblemCtx, real_id: &str) -> PipelineResult<Verdict> {
    ctx.check_cancelled()?;
    let (code, lang) = obtain_solution(ctx).await?;

    ctx.check_cancelled()?;
    ctx.log(
        Stage::Solve,
        format!("submitting {lang} solution to {} as {real_id}", ctx.target.name()),
    )
    .await;
    let handle = ctx
        .target
        .submit_solution(&ctx.adapter_ctx, real_id, &code, &lang)
        .await?;

    let started = Instant::now();
    let mut delay = ctx.config.judge_poll_initial;
    loop {
        ctx.sleep(delay).await?;
        let report = ctx.target.judge_status(&ctx.adapter_ctx, &handle).await?;
        if report.verdict.is_terminal() {
            ctx.log(Stage::Solve, format!("verdict: {:?}", report.verdict))
                .await;
            return match report.verdict {
                Verdict::Accepted => {
                    // Marker lands before the status row advances.
                    ctx.workspace
                        .put_verdict(Verdict::Accepted)
                        .await
                        .map_err(|e| {
                            PipelineError::Internal(format!("persisting verdict: {e}"))
                        })?;
                    Ok(Verdict::Accepted)
                }
                rejected => Err(PipelineError::SolveRejected(rejected)),
            };
        }
        if started.elapsed() > ctx.config.judge_poll_timeout {
            return Err(PipelineError::Timeout(format!(
                "judge still pending after {}s",
                ctx.config.judge_poll_timeout.as_secs()
            )));
        }
        delay = (delay * 2).min(ctx.config.judge_poll_max);
    }
}

async fn obtain_solution(ctx: &ProblemCtx) -> PipelineResult<(String, String)> {
    if let Some((path, lang)) = ctx.workspace.solution().await {
        let code = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| PipelineError::Internal(format!("reading solution: {e}")))?;
        ctx.log(Stage::Solve, "using solution from workspace").await;
        return Ok((code, lang));
    }

    if ctx
        .target
        .capabilities()
        .contains(&ojforge_adapters::Capability::ProvideSolution)
    {
        if let Some(code) = ctx
            .target
            .provide_solution(&ctx.adapter_ctx, &ctx.display_id)
            .await?
        {
            ctx.log(Stage::Solve, "using official solution from adapter").await;
            ctx.workspace
                .put_solution("cpp", &code)
                .await
                .map_err(|e| PipelineError::Internal(format!("saving solution: {e}")))?;
            return Ok((code, "cpp".to_string()));
        }
    }

    let statement = ctx.workspace.read_statement().await?;
    ctx.log(Stage::Solve, "asking the LLM for a solution").await;
    let prompt = format!(
        "Solve this programming problem in C++17. Read from stdin, write to stdout.\n\n\
         Title: {}\n\nStatement:\n{}\n\nInput format:\n{}\n\nOutput format:\n{}\n\n\
         Reply with a single ```cpp code block.",
        statement.title, statement.body, statement.input_format, statement.output_format
    );
    let reply = ctx
        .llm
        .call(
            LlmEndpoint::Solution,
            &prompt,
            CallOptions::default(),
            &ctx.cancel,
        )
        .await?;
    let code = extract_code_block(&reply.text, "cpp");
    if code.is_empty() {
        return Err(PipelineError::BadData("empty solution from LLM".into()));
    }
    ctx.workspace
        .put_solution("cpp", &code)
        .await
        .map_err(|e| PipelineError::Internal(format!("saving solution: {e}")))?;
    Ok((code, "cpp".to_string()))
}
