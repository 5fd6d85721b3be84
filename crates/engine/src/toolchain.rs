//! Local compile/run toolchain for generators and reference solutions.
//!
//! Subprocess work runs under the `compile` gate so local compilation never
//! saturates the host. The trait seam keeps stage tests hermetic.

use crate::EngineConfig;
use async_trait::async_trait;
use ojforge_concurrency::{GatePool, GATE_COMPILE};
use ojforge_models::{PipelineError, PipelineResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Run the generator script with a 1-based case index, returning the
    /// produced input.
    async fn generate_case(
        &self,
        script: &Path,
        index: usize,
        cancel: &CancellationToken,
    ) -> PipelineResult<String>;

    /// Compile a C++ reference solution, returning the binary path.
    async fn compile(&self, source: &Path, cancel: &CancellationToken) -> PipelineResult<PathBuf>;

    /// Run a compiled binary or python script on `input` under the run
    /// timeout, returning stdout.
    async fn run_solution(
        &self,
        program: &Path,
        lang: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<String>;
}

/// Real toolchain: `python3` for generators, the configured C++ compiler
/// for solutions.
pub struct SubprocessToolchain {
    config: EngineConfig,
    gates: Arc<GatePool>,
}

impl SubprocessToolchain {
    pub fn new(config: EngineConfig, gates: Arc<GatePool>) -> Self {
        Self { config, gates }
    }

    async fn run_with_timeout(
        mut command: Command,
        stdin_data: Option<&str>,
        timeout: Duration,
        cancel: &CancellationToken,
        what: &str,
    ) -> PipelineResult<String> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| PipelineError::Internal(format!("spawning {what}: {e}")))?;

        if let Some(data) = stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(data.as_bytes())
                    .await
                    .map_err(|e| PipelineError::Internal(format!("feeding {what}: {e}")))?;
            }
        }

        let output = tokio::select! {
            result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(PipelineError::Internal(format!("waiting for {what}: {e}"))),
                Err(_) => return Err(PipelineError::Timeout(format!("{what} after {}s", timeout.as_secs()))),
            },
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::BadData(format!(
                "{what} exited with {}: {}",
                output.status,
                stderr.chars().take(400).collect::<String>()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Toolchain for SubprocessToolchain {
    async fn generate_case(
        &self,
        script: &Path,
        index: usize,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let mut command = Command::new(&self.config.python);
        command.arg(script).arg(index.to_string());
        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }
        Self::run_with_timeout(command, None, self.config.gen_timeout, cancel, "generator").await
    }

    async fn compile(&self, source: &Path, cancel: &CancellationToken) -> PipelineResult<PathBuf> {
        let _permit = self.gates.acquire(GATE_COMPILE, cancel).await?;
        let binary = source.with_extension("bin");
        let mut command = Command::new(&self.config.cxx);
        command
            .args(&self.config.cxx_flags)
            .arg("-o")
            .arg(&binary)
            .arg(source);
        debug!(source = %source.display(), "compiling reference solution");
        Self::run_with_timeout(command, None, Duration::from_secs(60), cancel, "compiler")
            .await
            .map_err(|e| match e {
                PipelineError::BadData(detail) => {
                    debug!(%detail, "compile failed");
                    PipelineError::SolveRejected(ojforge_models::Verdict::CompileError)
                }
                other => other,
            })?;
        Ok(binary)
    }

    async fn run_solution(
        &self,
        program: &Path,
        lang: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let command = match lang {
            "py" => {
                let mut c = Command::new(&self.config.python);
                c.arg(program);
                c
            }
            _ => Command::new(program),
        };
        Self::run_with_timeout(
            command,
            Some(input),
            self.config.run_timeout,
            cancel,
            "reference solution",
        )
        .await
    }
}

/// Deterministic toolchain for tests: the "generator" emits `<index> <index>`
/// and the "solution" sums whitespace-separated integers.
pub struct FakeToolchain {
    pub fail_generation: bool,
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self {
            fail_generation: false,
        }
    }
}

impl Default for FakeToolchain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn generate_case(
        &self,
        _script: &Path,
        index: usize,
        _cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        if self.fail_generation {
            return Err(PipelineError::BadData("generator exited with 1".into()));
        }
        Ok(format!("{index} {index}\n"))
    }

    async fn compile(&self, source: &Path, _cancel: &CancellationToken) -> PipelineResult<PathBuf> {
        Ok(source.with_extension("bin"))
    }

    async fn run_solution(
        &self,
        _program: &Path,
        _lang: &str,
        input: &str,
        _cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let sum: i64 = input
            .split_whitespace()
            .filter_map(|t| t.parse::<i64>().ok())
            .sum();
        Ok(format!("{sum}\n"))
    }
}
