//! In-process mock judge for tests and local smoke runs.
//!
//! Keeps a shared "remote" problem table keyed by normalized title, so
//! duplicate-upload detection and post-upload title lookups behave like a
//! real target judge. Failure injection knobs drive the retry paths.

use crate::{
    Adapter, AdapterCtx, Capability, ConfigField, FieldKind, JudgeReport, SubmissionHandle,
    UploadOutcome,
};
use async_trait::async_trait;
use ojforge_models::{
    normalize_title, Limits, PipelineError, PipelineResult, Sample, Statement, Verdict,
};
use ojforge_workspace::Workspace;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// State of the simulated target judge, shared between adapter clones.
#[derive(Debug, Default)]
pub struct RemoteJudge {
    problems: HashMap<String, String>,
    next_id: u64,
    /// Domains observed in upload calls, for tenant-isolation assertions.
    pub seen_domains: Vec<String>,
}

impl RemoteJudge {
    fn assign_id(&mut self) -> String {
        self.next_id += 1;
        (1000 + self.next_id).to_string()
    }
}

#[derive(Debug, Default)]
struct FailurePlan {
    fetch_transient_failures: u32,
    fetch_error: Option<PipelineError>,
    upload_omits_real_id: bool,
    verdicts: VecDeque<Verdict>,
    provided_solution: Option<String>,
}

/// Mock adapter implementing every capability.
pub struct MockAdapter {
    name: String,
    remote: Arc<Mutex<RemoteJudge>>,
    plan: Mutex<FailurePlan>,
    pub fetch_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
    pub submit_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub provide_calls: AtomicUsize,
}

impl MockAdapter {
    pub fn named(name: &str) -> Self {
        Self::with_remote(name, Arc::new(Mutex::new(RemoteJudge::default())))
    }

    /// Two adapters sharing one remote table model the same physical judge.
    pub fn with_remote(name: &str, remote: Arc<Mutex<RemoteJudge>>) -> Self {
        Self {
            name: name.to_string(),
            remote,
            plan: Mutex::new(FailurePlan::default()),
            fetch_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            provide_calls: AtomicUsize::new(0),
        }
    }

    pub fn remote(&self) -> Arc<Mutex<RemoteJudge>> {
        Arc::clone(&self.remote)
    }

    /// Seed the simulated judge with an existing problem.
    pub fn seed_remote_problem(&self, title: &str, real_id: &str) {
        self.remote
            .lock()
            .unwrap()
            .problems
            .insert(normalize_title(title), real_id.to_string());
    }

    /// Fail the first `n` fetch attempts with a transient network error.
    pub fn fail_fetch_transiently(&self, n: u32) {
        self.plan.lock().unwrap().fetch_transient_failures = n;
    }

    /// Fail every fetch with the given error.
    pub fn fail_fetch_with(&self, err: PipelineError) {
        self.plan.lock().unwrap().fetch_error = Some(err);
    }

    /// Simulate a judge answering 200 with an empty body on upload.
    pub fn set_upload_omits_real_id(&self, omit: bool) {
        self.plan.lock().unwrap().upload_omits_real_id = omit;
    }

    /// Queue verdicts returned by successive `judge_status` polls. When the
    /// queue drains the judge answers `Accepted`.
    pub fn queue_verdicts(&self, verdicts: impl IntoIterator<Item = Verdict>) {
        self.plan.lock().unwrap().verdicts.extend(verdicts);
    }

    pub fn set_provided_solution(&self, code: &str) {
        self.plan.lock().unwrap().provided_solution = Some(code.to_string());
    }

    pub fn total_adapter_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
            + self.upload_calls.load(Ordering::SeqCst)
            + self.search_calls.load(Ordering::SeqCst)
            + self.submit_calls.load(Ordering::SeqCst)
            + self.status_calls.load(Ordering::SeqCst)
            + self.provide_calls.load(Ordering::SeqCst)
    }

    fn statement_for(pid: &str) -> Statement {
        Statement {
            title: format!("{pid} A+B Problem"),
            body: "Given two integers a and b, print a+b.".into(),
            input_format: "Two integers a, b.".into(),
            output_format: "One integer, a+b.".into(),
            samples: vec![Sample {
                input: "1 2\n".into(),
                output: "3\n".into(),
            }],
            limits: Limits::default(),
            tags: vec!["implementation".into()],
            notes: None,
            images: vec![],
        }
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        "Mock Judge"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::FetchProblem,
            Capability::UploadData,
            Capability::SubmitSolution,
            Capability::JudgeStatus,
            Capability::BatchFetch,
            Capability::ListTraining,
            Capability::ProvideSolution,
        ]
    }

    fn config_schema(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::new("base_url", FieldKind::Text, true, "Judge base URL"),
            ConfigField::new("domain", FieldKind::Text, true, "Target domain"),
            ConfigField::new("username", FieldKind::Text, true, "Account name"),
            ConfigField::new("password", FieldKind::Password, true, "Account password"),
        ]
    }

    async fn fetch_problem(&self, ctx: &AdapterCtx, pid: &str) -> PipelineResult<Statement> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        // Credentials are resolved on every call, never cached.
        let _config = ctx.config(&self.name).await?;

        let mut plan = self.plan.lock().unwrap();
        if let Some(err) = &plan.fetch_error {
            return Err(err.clone());
        }
        if plan.fetch_transient_failures > 0 {
            plan.fetch_transient_failures -= 1;
            return Err(PipelineError::TransientNetwork(
                "connection reset by mock".into(),
            ));
        }
        drop(plan);

        Ok(Self::statement_for(pid))
    }

    async fn upload_data(
        &self,
        ctx: &AdapterCtx,
        workspace: &Workspace,
    ) -> PipelineResult<UploadOutcome> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let config = ctx.config(&self.name).await?;

        if !workspace.has_generated_data().await {
            return Err(PipelineError::BadData("no generated cases to upload".into()));
        }
        let statement = workspace.read_statement().await?;

        let omit = self.plan.lock().unwrap().upload_omits_real_id;
        let mut remote = self.remote.lock().unwrap();
        if let Some(domain) = config.get("domain") {
            remote.seen_domains.push(domain.clone());
        }
        let key = normalize_title(&statement.title);
        let real_id = match remote.problems.get(&key).cloned() {
            Some(id) => id,
            None => {
                let id = remote.assign_id();
                remote.problems.insert(key, id.clone());
                id
            }
        };

        Ok(UploadOutcome {
            real_id: (!omit).then_some(real_id),
            extra: serde_json::json!({ "code": 0 }),
        })
    }

    async fn search_by_title(
        &self,
        ctx: &AdapterCtx,
        title: &str,
    ) -> PipelineResult<Option<String>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let _config = ctx.config(&self.name).await?;
        let remote = self.remote.lock().unwrap();
        Ok(remote.problems.get(&normalize_title(title)).cloned())
    }

    async fn submit_solution(
        &self,
        ctx: &AdapterCtx,
        real_id: &str,
        _code: &str,
        lang: &str,
    ) -> PipelineResult<SubmissionHandle> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let _config = ctx.config(&self.name).await?;
        let known = self
            .remote
            .lock()
            .unwrap()
            .problems
            .values()
            .any(|id| id == real_id);
        if !known {
            return Err(PipelineError::NotFound(format!(
                "problem {real_id} not on judge"
            )));
        }
        Ok(SubmissionHandle {
            id: format!("sub-{real_id}-{lang}"),
        })
    }

    async fn judge_status(
        &self,
        _ctx: &AdapterCtx,
        _handle: &SubmissionHandle,
    ) -> PipelineResult<JudgeReport> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let verdict = self
            .plan
            .lock()
            .unwrap()
            .verdicts
            .pop_front()
            .unwrap_or(Verdict::Accepted);
        Ok(JudgeReport {
            verdict,
            logs: None,
        })
    }

    async fn list_training_ids(
        &self,
        _ctx: &AdapterCtx,
        selector: &crate::TrainingSelector,
    ) -> PipelineResult<Vec<String>> {
        Ok(match selector {
            crate::TrainingSelector::Tag(tag) => vec![format!("{tag}-1"), format!("{tag}-2")],
            crate::TrainingSelector::Range { from, to } => {
                (*from..=*to).map(|i| i.to_string()).collect()
            }
        })
    }

    async fn provide_solution(
        &self,
        _ctx: &AdapterCtx,
        _pid: &str,
    ) -> PipelineResult<Option<String>> {
        self.provide_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.plan.lock().unwrap().provided_solution.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ojforge_storage::{CredentialCipher, MemoryRepository, Repository};
    use ojforge_workspace::WorkspaceStore;
    use std::collections::BTreeMap;

    async fn ctx_with_config(repo: Arc<MemoryRepository>, user_id: i64, domain: &str) -> AdapterCtx {
        let mut fields = BTreeMap::new();
        fields.insert("base_url".to_string(), "https://judge.test".to_string());
        fields.insert("domain".to_string(), domain.to_string());
        repo.save_adapter_config(user_id, "mock", &fields)
            .await
            .unwrap();
        AdapterCtx::new(user_id, repo)
    }

    #[tokio::test]
    async fn upload_reads_caller_config_each_call() {
        let repo = Arc::new(MemoryRepository::new(CredentialCipher::from_secret("t")));
        let adapter = MockAdapter::named("mock");
        let tmp = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(tmp.path());

        let ws_a = store.open_or_create(1, "shsoj_1").await.unwrap();
        ws_a.write_statement(&MockAdapter::statement_for("1"))
            .await
            .unwrap();
        ws_a.put_generated_case(1, "1\n", "1\n").await.unwrap();

        let ws_b = store.open_or_create(2, "shsoj_2").await.unwrap();
        ws_b.write_statement(&MockAdapter::statement_for("2"))
            .await
            .unwrap();
        ws_b.put_generated_case(1, "1\n", "1\n").await.unwrap();

        let ctx_a = ctx_with_config(Arc::clone(&repo), 1, "alpha").await;
        let ctx_b = ctx_with_config(Arc::clone(&repo), 2, "beta").await;

        let (ra, rb) = tokio::join!(
            adapter.upload_data(&ctx_a, &ws_a),
            adapter.upload_data(&ctx_b, &ws_b)
        );
        ra.unwrap();
        rb.unwrap();

        let mut seen = adapter.remote.lock().unwrap().seen_domains.clone();
        seen.sort();
        assert_eq!(seen, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn search_uses_normalized_titles() {
        let repo = Arc::new(MemoryRepository::new(CredentialCipher::from_secret("t")));
        let adapter = MockAdapter::named("mock");
        adapter.seed_remote_problem("P1001 A+B Problem", "2001");
        let ctx = ctx_with_config(repo, 1, "alpha").await;

        let found = adapter
            .search_by_title(&ctx, "P1001  A+B Problem")
            .await
            .unwrap();
        assert_eq!(found, Some("2001".to_string()));
    }

    #[tokio::test]
    async fn missing_config_is_an_auth_error() {
        let repo = Arc::new(MemoryRepository::new(CredentialCipher::from_secret("t")));
        let adapter = MockAdapter::named("mock");
        let ctx = AdapterCtx::new(9, repo);
        let err = adapter.fetch_problem(&ctx, "1001").await.unwrap_err();
        assert_eq!(err.kind(), "auth");
    }
}
