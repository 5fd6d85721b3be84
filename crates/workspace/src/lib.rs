//! Per-problem on-disk workspace.
//!
//! Layout, keyed by `<root>/<user_id>/<normalized_pid>/`:
//!
//! ```text
//! statement.json           canonical statement
//! samples/<i>.in|.out      original samples from the source judge
//! gen/gen.py               generator script (optional)
//! gen/<i>.in|.ans          generated cases
//! sol/solution.cpp|.py     reference solution
//! sol/verdict.json         accepted-verdict marker
//! upload/receipt.json      {adapter, real_id, url, uploaded_at}
//! logs/<stage>.log         free-form stage log
//! ```
//!
//! The `has_*` predicates are the idempotency oracle the pipeline runner
//! consults; a fresh process reconstructs runnability solely from disk.
//! All file writes are atomic (write-temp-then-rename).

use anyhow::{Context, Result};
use chrono::Utc;
use ojforge_models::{PipelineError, PipelineResult, Receipt, Stage, Statement, Verdict};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

mod archive;

/// Root of all workspaces, partitioned by user.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns a handle to the workspace for `(user, pid)`, creating the
    /// directory lazily. Concurrent calls for the same pair land on the
    /// same directory.
    pub async fn open_or_create(&self, user_id: i64, pid: &str) -> Result<Workspace> {
        let dir = self.root.join(user_id.to_string()).join(sanitize(pid));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating workspace {}", dir.display()))?;
        Ok(Workspace { dir })
    }
}

fn sanitize(pid: &str) -> String {
    pid.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Recorded outcome of a verified reference solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VerdictMarker {
    verdict: Verdict,
    recorded_at: chrono::DateTime<Utc>,
}

/// Handle to one problem's directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write_atomic(&self, rel: &str, contents: &[u8]) -> Result<()> {
        let path = self.dir.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp-write");
        tokio::fs::write(&tmp, contents)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    // ---- statement -------------------------------------------------------

    pub async fn has_statement(&self) -> bool {
        tokio::fs::try_exists(self.dir.join("statement.json"))
            .await
            .unwrap_or(false)
    }

    pub async fn read_statement(&self) -> PipelineResult<Statement> {
        let path = self.dir.join("statement.json");
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::NotFound(format!("statement.json: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::Parse(format!("statement.json: {e}")))
    }

    /// Persists the canonical statement plus the original samples.
    pub async fn write_statement(&self, statement: &Statement) -> Result<()> {
        for (i, sample) in statement.samples.iter().enumerate() {
            self.write_atomic(&format!("samples/{}.in", i + 1), sample.input.as_bytes())
                .await?;
            self.write_atomic(&format!("samples/{}.out", i + 1), sample.output.as_bytes())
                .await?;
        }
        self.write_atomic("statement.json", &serde_json::to_vec_pretty(statement)?)
            .await
    }

    // ---- generated data --------------------------------------------------

    pub async fn has_generated_data(&self) -> bool {
        !self.generated_cases().await.unwrap_or_default().is_empty()
    }

    pub async fn put_generator_script(&self, code: &str) -> Result<PathBuf> {
        self.write_atomic("gen/gen.py", code.as_bytes()).await?;
        Ok(self.dir.join("gen/gen.py"))
    }

    pub async fn generator_script(&self) -> Option<PathBuf> {
        let path = self.dir.join("gen/gen.py");
        tokio::fs::try_exists(&path)
            .await
            .unwrap_or(false)
            .then_some(path)
    }

    pub async fn put_generated_case(&self, index: usize, input: &str, expected: &str) -> Result<()> {
        self.write_atomic(&format!("gen/{index}.in"), input.as_bytes())
            .await?;
        self.write_atomic(&format!("gen/{index}.ans"), expected.as_bytes())
            .await
    }

    /// Complete `(input, answer)` pairs, sorted by index.
    pub async fn generated_cases(&self) -> Result<Vec<(PathBuf, PathBuf)>> {
        let gen_dir = self.dir.join("gen");
        let mut pairs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&gen_dir).await {
            Ok(e) => e,
            Err(_) => return Ok(pairs),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("in") {
                let ans = path.with_extension("ans");
                if tokio::fs::try_exists(&ans).await.unwrap_or(false) {
                    pairs.push((path, ans));
                }
            }
        }
        pairs.sort();
        Ok(pairs)
    }

    // ---- reference solution ---------------------------------------------

    /// First solution file present, with its language suffix.
    pub async fn solution(&self) -> Option<(PathBuf, String)> {
        for lang in ["cpp", "py"] {
            let path = self.dir.join(format!("sol/solution.{lang}"));
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some((path, lang.to_string()));
            }
        }
        None
    }

    pub async fn put_solution(&self, lang: &str, code: &str) -> Result<PathBuf> {
        let rel = format!("sol/solution.{lang}");
        self.write_atomic(&rel, code.as_bytes()).await?;
        Ok(self.dir.join(rel))
    }

    pub async fn has_accepted_solution(&self) -> bool {
        let path = self.dir.join("sol/verdict.json");
        let Ok(bytes) = tokio::fs::read(&path).await else {
            return false;
        };
        serde_json::from_slice::<VerdictMarker>(&bytes)
            .map(|m| m.verdict == Verdict::Accepted)
            .unwrap_or(false)
    }

    pub async fn put_verdict(&self, verdict: Verdict) -> Result<()> {
        let marker = VerdictMarker {
            verdict,
            recorded_at: Utc::now(),
        };
        self.write_atomic("sol/verdict.json", &serde_json::to_vec_pretty(&marker)?)
            .await
    }

    // ---- upload receipt --------------------------------------------------

    pub async fn get_upload_receipt(&self, adapter: &str) -> Result<Option<Receipt>> {
        let path = self.dir.join("upload/receipt.json");
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(_) => return Ok(None),
        };
        let receipt: Receipt = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok((receipt.adapter == adapter).then_some(receipt))
    }

    pub async fn put_upload_receipt(&self, receipt: &Receipt) -> Result<()> {
        self.write_atomic("upload/receipt.json", &serde_json::to_vec_pretty(receipt)?)
            .await
    }

    // ---- stage logs ------------------------------------------------------

    pub async fn append_stage_log(&self, stage: Stage, line: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let dir = self.dir.join("logs");
        tokio::fs::create_dir_all(&dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{stage}.log")))
            .await?;
        let stamped = format!("[{}] {line}\n", Utc::now().format("%H:%M:%S"));
        file.write_all(stamped.as_bytes()).await?;
        Ok(())
    }

    // ---- retry support ---------------------------------------------------

    /// Removes the artifacts a re-run of `stage` would regenerate, together
    /// with everything downstream of it. The receipt never survives without
    /// the generated data that produced it.
    pub async fn clear_from_stage(&self, stage: Stage) -> Result<()> {
        for s in stage.and_downstream() {
            match s {
                Stage::Fetch => {
                    remove_if_exists(self.dir.join("statement.json")).await?;
                    remove_dir_if_exists(self.dir.join("samples")).await?;
                }
                Stage::Generate => {
                    remove_dir_if_exists(self.dir.join("gen")).await?;
                }
                Stage::Upload => {
                    remove_dir_if_exists(self.dir.join("upload")).await?;
                }
                Stage::Solve => {
                    remove_if_exists(self.dir.join("sol/verdict.json")).await?;
                }
            }
        }
        debug!(dir = %self.dir.display(), from = %stage, "cleared stage artifacts");
        Ok(())
    }

    // ---- snapshot --------------------------------------------------------

    /// Zips the workspace subtree (file mode 0644, UTF-8 paths, stable
    /// ordering) for download.
    pub async fn snapshot_zip(&self) -> Result<Vec<u8>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || archive::zip_dir(&dir))
            .await
            .context("zip task panicked")?
    }

    /// Removes the whole directory tree.
    pub async fn remove(&self) -> Result<()> {
        remove_dir_if_exists(self.dir.clone()).await
    }
}

/// Zips several workspaces into one archive, each under its pid prefix.
pub async fn snapshot_zip_many(workspaces: &[(String, Workspace)]) -> Result<Vec<u8>> {
    let entries: Vec<(String, std::path::PathBuf)> = workspaces
        .iter()
        .map(|(prefix, ws)| (prefix.clone(), ws.dir.clone()))
        .collect();
    tokio::task::spawn_blocking(move || archive::zip_dirs(&entries))
        .await
        .context("zip task panicked")?
}

async fn remove_if_exists(path: PathBuf) -> Result<()> {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

async fn remove_dir_if_exists(path: PathBuf) -> Result<()> {
    match tokio::fs::remove_dir_all(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ojforge_models::{Limits, Sample};

    fn statement() -> Statement {
        Statement {
            title: "A+B Problem".into(),
            body: "add two integers".into(),
            input_format: "two integers".into(),
            output_format: "their sum".into(),
            samples: vec![Sample {
                input: "1 2\n".into(),
                output: "3\n".into(),
            }],
            limits: Limits::default(),
            tags: vec![],
            notes: None,
            images: vec![],
        }
    }

    async fn fixture() -> (tempfile::TempDir, Workspace) {
        let tmp = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(tmp.path());
        let ws = store.open_or_create(1, "shsoj_1001").await.unwrap();
        (tmp, ws)
    }

    #[tokio::test]
    async fn statement_round_trip() {
        let (_tmp, ws) = fixture().await;
        assert!(!ws.has_statement().await);

        ws.write_statement(&statement()).await.unwrap();
        assert!(ws.has_statement().await);
        assert_eq!(ws.read_statement().await.unwrap(), statement());
        assert!(tokio::fs::try_exists(ws.dir().join("samples/1.in"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn generated_data_oracle() {
        let (_tmp, ws) = fixture().await;
        assert!(!ws.has_generated_data().await);

        ws.put_generator_script("print(1)").await.unwrap();
        // A script alone is not generated data.
        assert!(!ws.has_generated_data().await);

        ws.put_generated_case(1, "1 2\n", "3\n").await.unwrap();
        assert!(ws.has_generated_data().await);
        assert_eq!(ws.generated_cases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn receipt_is_adapter_scoped() {
        let (_tmp, ws) = fixture().await;
        let receipt = Receipt {
            adapter: "hydrooj".into(),
            real_id: "77".into(),
            url: "https://oj.example.com/d/sys/p/77".into(),
            uploaded_at: Utc::now(),
        };
        ws.put_upload_receipt(&receipt).await.unwrap();

        assert_eq!(
            ws.get_upload_receipt("hydrooj").await.unwrap(),
            Some(receipt)
        );
        assert_eq!(ws.get_upload_receipt("shsoj").await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_from_generate_drops_receipt_too() {
        let (_tmp, ws) = fixture().await;
        ws.write_statement(&statement()).await.unwrap();
        ws.put_generated_case(1, "1\n", "1\n").await.unwrap();
        ws.put_upload_receipt(&Receipt {
            adapter: "mock".into(),
            real_id: "9".into(),
            url: "u".into(),
            uploaded_at: Utc::now(),
        })
        .await
        .unwrap();
        ws.put_verdict(Verdict::Accepted).await.unwrap();

        ws.clear_from_stage(Stage::Generate).await.unwrap();

        // Statement survives, downstream artifacts are gone.
        assert!(ws.has_statement().await);
        assert!(!ws.has_generated_data().await);
        assert_eq!(ws.get_upload_receipt("mock").await.unwrap(), None);
        assert!(!ws.has_accepted_solution().await);
    }

    #[tokio::test]
    async fn verdict_marker_gates_solve_skip() {
        let (_tmp, ws) = fixture().await;
        assert!(!ws.has_accepted_solution().await);
        ws.put_verdict(Verdict::WrongAnswer).await.unwrap();
        assert!(!ws.has_accepted_solution().await);
        ws.put_verdict(Verdict::Accepted).await.unwrap();
        assert!(ws.has_accepted_solution().await);
    }

    #[tokio::test]
    async fn snapshot_contains_workspace_files() {
        let (_tmp, ws) = fixture().await;
        ws.write_statement(&statement()).await.unwrap();
        ws.put_generated_case(1, "1 2\n", "3\n").await.unwrap();

        let bytes = ws.snapshot_zip().await.unwrap();
        let reader = std::io::Cursor::new(bytes);
        let mut zip = zip::ZipArchive::new(reader).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"statement.json".to_string()));
        assert!(names.contains(&"gen/1.in".to_string()));
    }
}
