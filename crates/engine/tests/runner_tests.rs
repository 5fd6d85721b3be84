//! End-to-end runner tests against the mock judge and a scripted LLM.

use ojforge_adapters::{mock::MockAdapter, Adapter, AdapterCtx};
use ojforge_concurrency::GatePool;
use ojforge_engine::{
    EngineConfig, EventBus, FakeToolchain, ProblemCtx, Runner, Toolchain,
};
use ojforge_llm::{LlmPool, ProviderClient, ScriptedClient};
use ojforge_models::{
    ConcurrencyConfig, Limits, PipelineError, ProblemRecord, ProblemState, RetryCounts, Sample,
    StageSet, Statement, Verdict,
};
use ojforge_storage::{CredentialCipher, MemoryRepository, Repository};
use ojforge_workspace::WorkspaceStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Harness {
    _tmp: tempfile::TempDir,
    repo: Arc<MemoryRepository>,
    gates: Arc<GatePool>,
    store: WorkspaceStore,
    source: Arc<MockAdapter>,
    target: Arc<MockAdapter>,
    llm: Arc<LlmPool>,
    script: Arc<ScriptedClient>,
    config: EngineConfig,
}

async fn harness_with(concurrency: ConcurrencyConfig) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let repo = Arc::new(MemoryRepository::new(CredentialCipher::from_secret("t")));
    let gates = GatePool::new(concurrency);
    let store = WorkspaceStore::new(tmp.path());
    let source = Arc::new(MockAdapter::named("src"));
    let target = Arc::new(MockAdapter::named("dst"));

    for adapter in ["src", "dst"] {
        let mut fields = BTreeMap::new();
        fields.insert("base_url".to_string(), "https://judge.test".to_string());
        fields.insert("domain".to_string(), "system".to_string());
        repo.save_adapter_config(1, adapter, &fields).await.unwrap();
    }

    let script = Arc::new(ScriptedClient::always("```python\nprint('1 2')\n```"));
    let mut clients: HashMap<String, Arc<dyn ProviderClient>> = HashMap::new();
    clients.insert("deepseek".to_string(), Arc::clone(&script) as Arc<dyn ProviderClient>);
    let llm = LlmPool::with_clients(
        Arc::clone(&gates),
        Arc::clone(&repo) as Arc<dyn Repository>,
        clients,
    );

    Harness {
        _tmp: tmp,
        repo,
        gates,
        store,
        source,
        target,
        llm,
        script,
        config: EngineConfig::fast(),
    }
}

async fn harness() -> Harness {
    harness_with(ConcurrencyConfig::default()).await
}

fn record(pid: &str) -> ProblemRecord {
    ProblemRecord {
        id: Uuid::new_v4(),
        task_id: Uuid::new_v4(),
        user_id: 1,
        pid: format!("shsoj_{pid}"),
        display_id: pid.to_string(),
        source_adapter: "src".into(),
        target_adapter: "dst".into(),
        state: ProblemState::Pending,
        retry_counts: RetryCounts::default(),
        last_error: None,
        real_id: None,
        uploaded_url: None,
        owner_worker: None,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

async fn ctx_for(h: &Harness, record: &ProblemRecord) -> ProblemCtx {
    let workspace = h.store.open_or_create(1, &record.pid).await.unwrap();
    ProblemCtx {
        user_id: 1,
        task_id: record.task_id,
        pid: record.pid.clone(),
        display_id: record.display_id.clone(),
        workspace,
        source: Some(Arc::clone(&h.source) as Arc<dyn Adapter>),
        target: Arc::clone(&h.target) as Arc<dyn Adapter>,
        adapter_ctx: AdapterCtx::new(1, Arc::clone(&h.repo) as Arc<dyn Repository>),
        llm: Arc::clone(&h.llm),
        gates: Arc::clone(&h.gates),
        toolchain: Arc::new(FakeToolchain::new()) as Arc<dyn Toolchain>,
        cancel: CancellationToken::new(),
        events: EventBus::default(),
        config: h.config.clone(),
    }
}

async fn run(h: &Harness, rec: ProblemRecord, stages: StageSet) -> (ProblemRecord, ProblemCtx) {
    let ctx = ctx_for(h, &rec).await;
    h.repo.insert_problem(&rec).await.unwrap();
    let runner = Runner::new(Arc::clone(&h.repo) as Arc<dyn Repository>, h.config.clone());
    let finished = runner.run_problem(rec, &ctx, stages).await;
    (finished, ctx)
}

fn all_stages() -> StageSet {
    StageSet::default()
}

#[tokio::test]
async fn full_pipeline_completes_and_uploads() {
    let h = harness().await;
    let (finished, ctx) = run(&h, record("1001"), all_stages()).await;

    assert_eq!(finished.state, ProblemState::Completed);
    assert!(ctx.workspace.has_statement().await);
    assert!(!ctx.workspace.generated_cases().await.unwrap().is_empty());
    assert!(ctx
        .workspace
        .get_upload_receipt("dst")
        .await
        .unwrap()
        .is_some());
    assert!(ctx.workspace.has_accepted_solution().await);

    let url = finished.uploaded_url.expect("uploaded_url set");
    assert!(
        url.starts_with("https://judge.test/d/system/p/"),
        "unexpected url {url}"
    );
    assert!(finished.real_id.is_some());

    // Persisted row matches the returned record.
    let row = h.repo.get_problem(finished.id).await.unwrap().unwrap();
    assert_eq!(row.state, ProblemState::Completed);
    assert_eq!(row.uploaded_url, Some(url));
}

#[tokio::test]
async fn cached_workspace_runs_with_zero_adapter_and_llm_calls() {
    let h = harness().await;
    let (first, _ctx) = run(&h, record("1001"), all_stages()).await;
    assert_eq!(first.state, ProblemState::Completed);

    let adapter_calls = h.source.total_adapter_calls() + h.target.total_adapter_calls();
    let llm_calls = h.script.calls();

    // Second run over the same workspace: pending -> completed untouched.
    let (second, _ctx) = run(&h, record("1001"), all_stages()).await;
    assert_eq!(second.state, ProblemState::Completed);
    assert_eq!(
        h.source.total_adapter_calls() + h.target.total_adapter_calls(),
        adapter_calls,
        "skip path must not touch adapters"
    );
    assert_eq!(h.script.calls(), llm_calls, "skip path must not touch the LLM");
    // The receipt still hydrates the uploaded url.
    assert_eq!(second.uploaded_url, first.uploaded_url);
    assert_eq!(second.real_id, first.real_id);
}

#[tokio::test]
async fn duplicate_title_on_target_skips_upload() {
    let h = harness().await;
    h.target.seed_remote_problem("1001 A+B Problem", "4242");

    let stages = StageSet {
        solve: false,
        ..StageSet::default()
    };
    let (finished, ctx) = run(&h, record("1001"), stages).await;

    assert_eq!(finished.state, ProblemState::Completed);
    assert_eq!(finished.real_id.as_deref(), Some("4242"));
    assert_eq!(
        h.target.upload_calls.load(std::sync::atomic::Ordering::SeqCst),
        0,
        "existing title must not be re-uploaded"
    );
    let receipt = ctx.workspace.get_upload_receipt("dst").await.unwrap().unwrap();
    assert_eq!(receipt.real_id, "4242");
}

#[tokio::test]
async fn empty_upload_response_falls_back_to_title_search() {
    let h = harness().await;
    h.target.set_upload_omits_real_id(true);

    let stages = StageSet {
        solve: false,
        ..StageSet::default()
    };
    let (finished, ctx) = run(&h, record("1001"), stages).await;

    assert_eq!(finished.state, ProblemState::Completed);
    assert_eq!(
        h.target.upload_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    // One search before upload, one as the no-id fallback.
    assert_eq!(
        h.target.search_calls.load(std::sync::atomic::Ordering::SeqCst),
        2
    );
    assert!(ctx
        .workspace
        .get_upload_receipt("dst")
        .await
        .unwrap()
        .is_some());
    assert!(finished.real_id.is_some());
}

#[tokio::test]
async fn transient_fetch_errors_retry_then_succeed() {
    let h = harness().await;
    h.source.fail_fetch_transiently(2);

    let stages = StageSet {
        fetch: true,
        generate: false,
        upload: false,
        solve: false,
    };
    let (finished, ctx) = run(&h, record("1001"), stages).await;

    assert_eq!(finished.state, ProblemState::Completed);
    assert_eq!(
        h.source.fetch_calls.load(std::sync::atomic::Ordering::SeqCst),
        3
    );
    assert_eq!(finished.retry_counts.fetch, 2);
    assert!(ctx.workspace.has_statement().await);
}

#[tokio::test]
async fn exhausted_retries_fail_the_stage() {
    let h = harness().await;
    h.source.fail_fetch_transiently(10);

    let stages = StageSet {
        fetch: true,
        generate: false,
        upload: false,
        solve: false,
    };
    let (finished, _ctx) = run(&h, record("1001"), stages).await;

    assert_eq!(finished.state, ProblemState::FailedFetch);
    let err = finished.last_error.unwrap();
    assert_eq!(err.kind, "stage_exhausted(fetch)");
}

#[tokio::test]
async fn non_retryable_fetch_fails_immediately() {
    let h = harness().await;
    h.source
        .fail_fetch_with(PipelineError::NotFound("no such problem".into()));

    let (finished, _ctx) = run(&h, record("9999"), all_stages()).await;

    assert_eq!(finished.state, ProblemState::FailedFetch);
    assert_eq!(
        h.source.fetch_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    assert_eq!(finished.last_error.unwrap().kind, "not_found");
}

#[tokio::test]
async fn cancel_while_blocked_on_llm_gate_is_prompt_and_clean() {
    let concurrency = ConcurrencyConfig {
        max_llm_concurrent: 0,
        ..ConcurrencyConfig::default()
    };
    let h = harness_with(concurrency).await;

    let rec = record("1001");
    let ctx = ctx_for(&h, &rec).await;
    // Statement cached: the runner goes straight to Generate and blocks on
    // the saturated llm gate.
    ctx.workspace
        .write_statement(&Statement {
            title: "1001 A+B Problem".into(),
            body: "sum".into(),
            input_format: String::new(),
            output_format: String::new(),
            samples: vec![Sample {
                input: "1 2\n".into(),
                output: "3\n".into(),
            }],
            limits: Limits::default(),
            tags: vec![],
            notes: None,
            images: vec![],
        })
        .await
        .unwrap();
    h.repo.insert_problem(&rec).await.unwrap();

    let cancel = ctx.cancel.clone();
    let workspace = ctx.workspace.clone();
    let runner = Runner::new(Arc::clone(&h.repo) as Arc<dyn Repository>, h.config.clone());
    let stages = StageSet {
        fetch: false,
        generate: true,
        upload: false,
        solve: false,
    };
    let handle = tokio::spawn(async move { runner.run_problem(rec, &ctx, stages).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!handle.is_finished());
    cancel.cancel();

    let finished = tokio::time::timeout(Duration::from_millis(100), handle)
        .await
        .expect("cancel must land within 100ms")
        .unwrap();
    assert_eq!(finished.state, ProblemState::Cancelled);
    // No partial files in gen/.
    assert!(workspace.generated_cases().await.unwrap().is_empty());
    assert!(workspace.generator_script().await.is_none());
}

#[tokio::test]
async fn rejected_solution_fails_solve_with_verdict_kind() {
    let h = harness().await;
    h.target.queue_verdicts([Verdict::WrongAnswer]);

    let (finished, ctx) = run(&h, record("1001"), all_stages()).await;

    assert_eq!(finished.state, ProblemState::FailedSolve);
    assert_eq!(finished.last_error.unwrap().kind, "solve_wrong_answer");
    assert!(!ctx.workspace.has_accepted_solution().await);
    // Upload outcome survives the solve failure.
    assert!(finished.uploaded_url.is_some());
}

#[tokio::test]
async fn solution_sources_short_circuit_on_workspace_copy() {
    let h = harness().await;
    let rec = record("1001");
    let ctx = ctx_for(&h, &rec).await;
    ctx.workspace
        .put_solution("cpp", "int main() { return 0; }")
        .await
        .unwrap();
    h.repo.insert_problem(&rec).await.unwrap();

    let runner = Runner::new(Arc::clone(&h.repo) as Arc<dyn Repository>, h.config.clone());
    let finished = runner.run_problem(rec, &ctx, all_stages()).await;

    assert_eq!(finished.state, ProblemState::Completed);
    assert_eq!(
        h.target.provide_calls.load(std::sync::atomic::Ordering::SeqCst),
        0,
        "workspace solution must win over the adapter's"
    );
}
