//! Generate (G): have the LLM write a data generator, execute it, and pair
//! each input with an expected output.
//!
//! Expected outputs come from the reference solution when one is on disk,
//! else from a per-input LLM fallback. Attempts inside the stage carry the
//! previous failure into the next prompt and cool the sampling temperature,
//! bounded by the stage attempt cap.

use crate::stages::{extract_code_block, StageOutcome};
use crate::ProblemCtx;
use ojforge_llm::{CallOptions, LlmEndpoint};
use ojforge_models::{PipelineError, PipelineResult, Stage, Statement};
use std::path::PathBuf;

const BASE_TEMPERATURE: f32 = 0.3;
const COOL_STEP: f32 = 0.1;

pub async fn run(ctx: &ProblemCtx) -> PipelineResult<StageOutcome> {
    ctx.check_cancelled()?;
    let mut statement = ctx.workspace.read_statement().await?;
    resolve_images(ctx, &mut statement).await?;

    let mut attempt_context: Vec<String> = Vec::new();
    let mut temperature = BASE_TEMPERATURE;
    let mut last_error = PipelineError::Internal("generator produced nothing".into());

    for attempt in 1..=ctx.config.stage_max_attempts {
        ctx.check_cancelled()?;
        ctx.log(
            Stage::Generate,
            format!(
                "attempt {attempt}/{} (temperature {temperature:.2})",
                ctx.config.stage_max_attempts
            ),
        )
        .await;

        match try_generate(ctx, &statement, &attempt_context, temperature).await {
            Ok(outcome) => return Ok(outcome),
            Err(e @ PipelineError::Cancelled) => return Err(e),
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                // Only content-level failures are worth a re-prompt; auth
                // and similar input errors surface immediately.
                let recoverable = matches!(
                    e.kind().as_str(),
                    "bad_data" | "gen_insufficient" | "solve_compile" | "parse"
                );
                if !recoverable {
                    return Err(e);
                }
                ctx.log(Stage::Generate, format!("attempt {attempt} failed: {e}"))
                    .await;
                attempt_context.push(e.to_string());
                // Compile-style failures cool harder.
                let step = if e.kind() == "solve_compile" {
                    COOL_STEP * 2.0
                } else {
                    COOL_STEP
                };
                temperature = (temperature - step).max(0.1);
                last_error = e;
            }
        }
    }
    Err(last_error)
}

/// OCR images that carry no text alternative, folding the recognized text
/// into the statement body used for prompting. The OCR client is built
/// lazily inside the pool, so text-only statements never touch it.
async fn resolve_images(ctx: &ProblemCtx, statement: &mut Statement) -> PipelineResult<()> {
    let pending: Vec<String> = statement
        .images_needing_ocr()
        .map(|i| i.url.clone())
        .collect();
    for url in pending {
        ctx.check_cancelled()?;
        ctx.log(Stage::Generate, format!("running OCR for {url}")).await;
        let reply = ctx
            .llm
            .call(
                LlmEndpoint::Ocr,
                &format!("Transcribe the text content of the image at {url}."),
                CallOptions::default(),
                &ctx.cancel,
            )
            .await?;
        statement
            .body
            .push_str(&format!("\n[image {url}]: {}", reply.text.trim()));
    }
    Ok(())
}

async fn try_generate(
    ctx: &ProblemCtx,
    statement: &Statement,
    attempt_context: &[String],
    temperature: f32,
) -> PipelineResult<StageOutcome> {
    // Sub-phase (a): produce the generator script.
    let prompt = generator_prompt(statement, attempt_context, ctx.config.gen_case_count);
    let reply = ctx
        .llm
        .call(
            LlmEndpoint::Generation,
            &prompt,
            CallOptions {
                temperature,
                max_tokens: None,
            },
            &ctx.cancel,
        )
        .await?;
    let script_code = extract_code_block(&reply.text, "python");
    if script_code.is_empty() {
        return Err(PipelineError::BadData("empty generator script".into()));
    }
    let script = ctx
        .workspace
        .put_generator_script(&script_code)
        .await
        .map_err(|e| PipelineError::Internal(format!("saving generator: {e}")))?;

    // Sub-phase (b): execute it case by case.
    let solution = prepare_reference(ctx).await?;
    let want = ctx.config.gen_case_count;
    let mut produced = 0usize;
    for index in 1..=want {
        ctx.check_cancelled()?;
        let input = match ctx
            .toolchain
            .generate_case(&script, index, &ctx.cancel)
            .await
        {
            Ok(input) if !input.trim().is_empty() => input,
            Ok(_) => {
                ctx.log(Stage::Generate, format!("case {index}: empty input, skipped"))
                    .await;
                continue;
            }
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => {
                ctx.log(Stage::Generate, format!("case {index}: generator error: {e}"))
                    .await;
                continue;
            }
        };

        let expected = match expected_output(ctx, statement, &solution, &input).await {
            Ok(out) => out,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => {
                ctx.log(Stage::Generate, format!("case {index}: no expected output: {e}"))
                    .await;
                continue;
            }
        };

        ctx.workspace
            .put_generated_case(index, &input, &expected)
            .await
            .map_err(|e| PipelineError::Internal(format!("saving case {index}: {e}")))?;
        produced += 1;
    }

    if produced == 0 || produced < ctx.config.gen_case_floor {
        return Err(PipelineError::GenInsufficient {
            got: produced,
            want,
        });
    }

    ctx.log(Stage::Generate, format!("generated {produced}/{want} cases"))
        .await;
    if produced < want {
        Ok(StageOutcome::DoneWithWarning(format!(
            "only {produced}/{want} cases succeeded"
        )))
    } else {
        Ok(StageOutcome::Done)
    }
}

enum Reference {
    Compiled(PathBuf, String),
    LlmFallback,
}

async fn prepare_reference(ctx: &ProblemCtx) -> PipelineResult<Reference> {
    match ctx.workspace.solution().await {
        Some((path, lang)) if lang == "cpp" => {
            let binary = ctx.toolchain.compile(&path, &ctx.cancel).await?;
            Ok(Reference::Compiled(binary, lang))
        }
        Some((path, lang)) => Ok(Reference::Compiled(path, lang)),
        None => Ok(Reference::LlmFallback),
    }
}

async fn expected_output(
    ctx: &ProblemCtx,
    statement: &Statement,
    reference: &Reference,
    input: &str,
) -> PipelineResult<String> {
    match reference {
        Reference::Compiled(program, lang) => {
            ctx.toolchain
                .run_solution(program, lang, input, &ctx.cancel)
                .await
        }
        Reference::LlmFallback => {
            let prompt = format!(
                "You are the reference judge for this problem.\n\n{}\n\n{}\n\nInput:\n{}\n\nReply with ONLY the exact expected output, no commentary.",
                statement.title, statement.body, input
            );
            let reply = ctx
                .llm
                .call(
                    LlmEndpoint::Generation,
                    &prompt,
                    CallOptions::default(),
                    &ctx.cancel,
                )
                .await?;
            let mut text = reply.text.trim().to_string();
            text.push('\n');
            Ok(text)
        }
    }
}

fn generator_prompt(statement: &Statement, attempt_context: &[String], cases: usize) -> String {
    let mut prompt = format!(
        "Write a Python 3 test-data generator for this programming problem.\n\
         The script receives a 1-based case index as argv[1] and must print one\n\
         test input to stdout. Vary difficulty with the index; index 1..{cases} will be used.\n\n\
         Title: {}\n\nStatement:\n{}\n\nInput format:\n{}\n",
        statement.title, statement.body, statement.input_format
    );
    if !statement.samples.is_empty() {
        prompt.push_str(&format!(
            "\nSample input:\n{}\n",
            statement.samples[0].input
        ));
    }
    if !attempt_context.is_empty() {
        prompt.push_str("\nPrevious attempts failed, avoid these mistakes:\n");
        for (i, err) in attempt_context.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, err));
        }
    }
    prompt.push_str("\nReply with a single ```python code block.\n");
    prompt
}
