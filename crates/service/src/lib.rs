//! Task service: batch intake, admission under the gates, aggregate status,
//! and the stable operations a transport layer binds to REST.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use ojforge_adapters::AdapterRegistry;
use ojforge_concurrency::{GatePool, GATE_GLOBAL, GATE_QUEUE};
use ojforge_engine::{EngineConfig, EventBus, ProblemCtx, Runner, Toolchain};
use ojforge_llm::{LlmEndpoint, LlmPool};
use ojforge_models::{
    normalize, EventKind, LastError, Paging, ProblemRecord, ProblemState, ProgressEvent,
    RetryCounts, Stage, StageSet, TaskFilter, TaskListPage, TaskRecord, TaskSpec, TaskStatus,
};
use ojforge_storage::Repository;
use ojforge_workspace::WorkspaceStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

mod auth;
mod system;

pub use auth::AuthService;
pub use system::SystemService;

/// Shared wiring of the core components, owned by the binary and handed to
/// the services.
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub registry: Arc<AdapterRegistry>,
    pub gates: Arc<GatePool>,
    pub llm: Arc<LlmPool>,
    pub store: WorkspaceStore,
    pub bus: EventBus,
    pub engine_config: EngineConfig,
    pub toolchain: Arc<dyn Toolchain>,
}

struct ActiveTask {
    cancel: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
}

/// Accepts batches, admits problems to the runner under the gates, and is
/// the only writer of task-level aggregate status.
pub struct TaskService {
    state: Arc<AppState>,
    active: Mutex<HashMap<Uuid, ActiveTask>>,
    shutdown: CancellationToken,
    drivers: Mutex<JoinSet<()>>,
}

impl TaskService {
    pub fn new(state: Arc<AppState>) -> Arc<Self> {
        Arc::new(Self {
            state,
            active: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            drivers: Mutex::new(JoinSet::new()),
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Validates and persists a batch, then spawns its runner cohort.
    pub async fn create_task(self: &Arc<Self>, user_id: i64, spec: TaskSpec) -> Result<Uuid> {
        if self.shutdown.is_cancelled() {
            bail!("service is draining, no new tasks accepted");
        }
        if spec.problems.is_empty() {
            bail!("task contains no problems");
        }
        if self.state.registry.get(&spec.target_adapter).is_none() {
            bail!("unknown target adapter: {}", spec.target_adapter);
        }

        let stages = spec.stages.normalized(spec.solve_cleared);
        let mut refs = Vec::with_capacity(spec.problems.len());
        for raw in &spec.problems {
            let parsed = normalize(&raw.raw, raw.source_adapter.as_deref())
                .with_context(|| format!("invalid problem reference: {}", raw.raw))?;
            refs.push(parsed);
        }

        let now = Utc::now();
        let task = TaskRecord {
            id: Uuid::new_v4(),
            user_id,
            stages,
            target_adapter: spec.target_adapter.clone(),
            llm_provider: spec.llm_provider.clone(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.state.repo.insert_task(&task).await?;

        let mut problems = Vec::with_capacity(refs.len());
        for r in refs {
            let record = ProblemRecord {
                id: Uuid::new_v4(),
                task_id: task.id,
                user_id,
                pid: r.normalized_pid(),
                display_id: r.display().to_string(),
                source_adapter: r.source.clone(),
                target_adapter: spec.target_adapter.clone(),
                state: ProblemState::Pending,
                retry_counts: RetryCounts::default(),
                last_error: None,
                real_id: None,
                uploaded_url: None,
                owner_worker: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            self.state.repo.insert_problem(&record).await?;
            problems.push(record);
        }

        if let Some(provider) = &spec.llm_provider {
            self.state
                .llm
                .assign_endpoint(LlmEndpoint::Generation, provider)
                .await;
            self.state
                .llm
                .assign_endpoint(LlmEndpoint::Solution, provider)
                .await;
        }

        self.state
            .repo
            .log_activity(
                user_id,
                "create_task",
                serde_json::json!({
                    "task_id": task.id,
                    "problems": problems.iter().map(|p| p.pid.clone()).collect::<Vec<_>>(),
                }),
            )
            .await?;
        self.state
            .bus
            .publish(ProgressEvent::new(EventKind::TaskCreated, task.id));

        info!(task_id = %task.id, user_id, count = problems.len(), "task created");
        self.spawn_driver(task.id, user_id, problems, stages, false);
        Ok(task.id)
    }

    fn spawn_driver(
        self: &Arc<Self>,
        task_id: Uuid,
        user_id: i64,
        problems: Vec<ProblemRecord>,
        stages: StageSet,
        is_retry: bool,
    ) {
        let cancel = self.shutdown.child_token();
        let cancel_requested = Arc::new(AtomicBool::new(false));
        self.active.lock().expect("active map poisoned").insert(
            task_id,
            ActiveTask {
                cancel: cancel.clone(),
                cancel_requested: Arc::clone(&cancel_requested),
            },
        );

        let service = Arc::clone(self);
        self.drivers
            .lock()
            .expect("driver set poisoned")
            .spawn(async move {
                service
                    .drive_task(task_id, user_id, problems, stages, cancel, cancel_requested)
                    .await;
                if is_retry {
                    info!(task_id = %task_id, "retry cohort finished");
                }
            });
    }

    async fn drive_task(
        self: Arc<Self>,
        task_id: Uuid,
        user_id: i64,
        problems: Vec<ProblemRecord>,
        stages: StageSet,
        cancel: CancellationToken,
        cancel_requested: Arc<AtomicBool>,
    ) {
        let _ = self
            .state
            .repo
            .update_task_status(task_id, TaskStatus::Running)
            .await;
        self.state.bus.publish(
            ProgressEvent::new(EventKind::TaskStarted, task_id)
                .with_payload(serde_json::json!({ "user_id": user_id })),
        );

        let mut cohort = JoinSet::new();
        for record in problems {
            let service = Arc::clone(&self);
            let cancel = cancel.clone();
            cohort.spawn(async move {
                service.admit_and_run(record, stages, cancel).await;
            });
        }
        while cohort.join_next().await.is_some() {}

        let final_problems = self
            .state
            .repo
            .problems_for_task(task_id)
            .await
            .unwrap_or_default();
        let status = aggregate_status(cancel_requested.load(Ordering::SeqCst), &final_problems);
        if let Err(e) = self.state.repo.update_task_status(task_id, status).await {
            warn!(task_id = %task_id, error = %e, "task status update failed");
        }

        let event_kind = match status {
            TaskStatus::Completed => EventKind::TaskCompleted,
            _ => EventKind::TaskFailed,
        };
        let mut event = ProgressEvent::new(event_kind, task_id).with_status(status.as_str());
        if status != TaskStatus::Completed {
            let reason = final_problems
                .iter()
                .filter_map(|p| p.last_error.as_ref())
                .map(|e| e.kind.clone())
                .next()
                .unwrap_or_else(|| "unknown".into());
            event = event.with_payload(serde_json::json!({ "reason": reason }));
        }
        self.state.bus.publish(event);

        self.active
            .lock()
            .expect("active map poisoned")
            .remove(&task_id);
    }

    /// Admission: queue ⊓ global ⊓ per-user, in that order, then hand the
    /// problem to the runner.
    async fn admit_and_run(&self, record: ProblemRecord, stages: StageSet, cancel: CancellationToken) {
        let Some(_queue) = self.state.gates.try_acquire(GATE_QUEUE) else {
            self.write_unowned(record, |r| {
                r.state = ProblemState::failed(Stage::Fetch);
                r.last_error = Some(LastError {
                    kind: "internal".into(),
                    message: "admission queue full".into(),
                });
            })
            .await;
            return;
        };

        let global = self.state.gates.acquire(GATE_GLOBAL, &cancel).await;
        let _global = match global {
            Ok(permit) => permit,
            Err(_) => {
                self.write_unowned(record, |r| {
                    r.state = ProblemState::Cancelled;
                })
                .await;
                return;
            }
        };
        let user_gate = GatePool::user_gate_name(record.user_id);
        let _user = match self.state.gates.acquire(&user_gate, &cancel).await {
            Ok(permit) => permit,
            Err(_) => {
                self.write_unowned(record, |r| {
                    r.state = ProblemState::Cancelled;
                })
                .await;
                return;
            }
        };
        drop(_queue);

        let workspace = match self
            .state
            .store
            .open_or_create(record.user_id, &record.pid)
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                warn!(pid = %record.pid, error = %e, "workspace open failed");
                self.write_unowned(record, |r| {
                    r.state = ProblemState::failed(Stage::Fetch);
                    r.last_error = Some(LastError {
                        kind: "internal".into(),
                        message: format!("workspace open failed: {e}"),
                    });
                })
                .await;
                return;
            }
        };

        let Some(target) = self.state.registry.get(&record.target_adapter) else {
            self.write_unowned(record, |r| {
                r.state = ProblemState::failed(Stage::Upload);
                r.last_error = Some(LastError {
                    kind: "internal".into(),
                    message: "target adapter disappeared".into(),
                });
            })
            .await;
            return;
        };

        let ctx = ProblemCtx {
            user_id: record.user_id,
            task_id: record.task_id,
            pid: record.pid.clone(),
            display_id: record.display_id.clone(),
            workspace,
            source: self.state.registry.get(&record.source_adapter),
            target,
            adapter_ctx: ojforge_adapters::AdapterCtx::new(
                record.user_id,
                Arc::clone(&self.state.repo),
            ),
            llm: Arc::clone(&self.state.llm),
            gates: Arc::clone(&self.state.gates),
            toolchain: Arc::clone(&self.state.toolchain),
            cancel,
            events: self.state.bus.clone(),
            config: self.state.engine_config.clone(),
        };

        let runner = Runner::new(Arc::clone(&self.state.repo), self.state.engine_config.clone());
        runner.run_problem(record, &ctx, stages).await;
    }

    /// Claim-update-release for rows no runner owns.
    async fn write_unowned(&self, mut record: ProblemRecord, apply: impl FnOnce(&mut ProblemRecord)) {
        let owner = format!("service-{}", Uuid::new_v4());
        match self.state.repo.claim_problem(record.id, &owner).await {
            Ok(true) => {
                apply(&mut record);
                if let Err(e) = self.state.repo.update_problem(&record, &owner).await {
                    warn!(pid = %record.pid, error = %e, "unowned write failed");
                }
                let _ = self.state.repo.release_problem(record.id, &owner).await;
            }
            _ => warn!(pid = %record.pid, "row is owned elsewhere, skipping write"),
        }
    }

    // ---- queries ---------------------------------------------------------

    pub async fn get_task(
        &self,
        user_id: i64,
        is_admin: bool,
        task_id: Uuid,
    ) -> Result<Option<(TaskRecord, Vec<ProblemRecord>)>> {
        let Some(task) = self.state.repo.get_task(task_id).await? else {
            return Ok(None);
        };
        if task.user_id != user_id && !is_admin {
            return Ok(None);
        }
        let problems = self.state.repo.problems_for_task(task_id).await?;
        Ok(Some((task, problems)))
    }

    pub async fn list_tasks(
        &self,
        user_id: i64,
        filter: &TaskFilter,
        paging: Paging,
    ) -> Result<TaskListPage> {
        self.state.repo.list_tasks(user_id, filter, paging).await
    }

    // ---- operations ------------------------------------------------------

    pub fn cancel_task(&self, task_id: Uuid) -> bool {
        let active = self.active.lock().expect("active map poisoned");
        match active.get(&task_id) {
            Some(task) => {
                task.cancel_requested.store(true, Ordering::SeqCst);
                task.cancel.cancel();
                info!(task_id = %task_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// User-initiated retry: clears the chosen stage and everything
    /// downstream of it (workspace artifacts included), resets the retry
    /// counters from that stage, and re-admits the problems.
    pub async fn retry(
        self: &Arc<Self>,
        user_id: i64,
        is_admin: bool,
        task_id: Uuid,
        stage: Option<Stage>,
    ) -> Result<usize> {
        let Some((task, problems)) = self.get_task(user_id, is_admin, task_id).await? else {
            bail!("task not found");
        };
        if problems.iter().any(|p| !p.state.is_terminal() && p.state != ProblemState::Pending) {
            bail!("task is still running");
        }
        let from = stage.unwrap_or(Stage::Fetch);

        let mut to_run = Vec::new();
        for mut record in problems {
            if record.state == ProblemState::Completed && stage.is_none() {
                continue;
            }
            let workspace = self
                .state
                .store
                .open_or_create(record.user_id, &record.pid)
                .await?;
            workspace.clear_from_stage(from).await?;

            record.state = ProblemState::Pending;
            record.last_error = None;
            record.retry_counts.reset_from(from);
            if from == Stage::Fetch || from == Stage::Generate || from == Stage::Upload {
                record.real_id = None;
                record.uploaded_url = None;
            }
            self.write_unowned(record.clone(), |_| {}).await;
            to_run.push(record);
        }
        if to_run.is_empty() {
            return Ok(0);
        }

        self.state
            .repo
            .log_activity(
                user_id,
                "retry_task",
                serde_json::json!({ "task_id": task_id, "stage": from.as_str(), "count": to_run.len() }),
            )
            .await?;

        let count = to_run.len();
        self.spawn_driver(task_id, task.user_id, to_run, task.stages, true);
        Ok(count)
    }

    /// Deletes the task rows. Workspaces with an accepted solution are kept
    /// for reuse; anything else is removed.
    pub async fn delete(&self, user_id: i64, is_admin: bool, task_id: Uuid) -> Result<bool> {
        let Some((_, problems)) = self.get_task(user_id, is_admin, task_id).await? else {
            return Ok(false);
        };
        self.cancel_task(task_id);

        for problem in &problems {
            let workspace = self
                .state
                .store
                .open_or_create(problem.user_id, &problem.pid)
                .await?;
            if workspace.has_accepted_solution().await {
                info!(pid = %problem.pid, "keeping accepted workspace");
            } else if let Err(e) = workspace.remove().await {
                warn!(pid = %problem.pid, error = %e, "workspace removal failed");
            }
        }

        self.state.repo.delete_task(task_id).await?;
        self.state
            .repo
            .log_activity(
                user_id,
                "delete_task",
                serde_json::json!({ "task_id": task_id }),
            )
            .await?;
        Ok(true)
    }

    /// Zip of all problem workspaces of a task, one prefix per problem.
    pub async fn download_workspace(
        &self,
        user_id: i64,
        is_admin: bool,
        task_id: Uuid,
    ) -> Result<Vec<u8>> {
        let Some((_, problems)) = self.get_task(user_id, is_admin, task_id).await? else {
            bail!("task not found");
        };
        let mut entries = Vec::with_capacity(problems.len());
        for problem in &problems {
            let workspace = self
                .state
                .store
                .open_or_create(problem.user_id, &problem.pid)
                .await?;
            entries.push((problem.pid.clone(), workspace));
        }
        ojforge_workspace::snapshot_zip_many(&entries).await
    }

    /// Graceful drain: no new admissions; in-flight problems stop at their
    /// next suspension point and persist state.
    pub async fn shutdown(&self) {
        info!("task service draining");
        self.shutdown.cancel();
        let mut drivers = {
            let mut guard = self.drivers.lock().expect("driver set poisoned");
            std::mem::take(&mut *guard)
        };
        while drivers.join_next().await.is_some() {}
    }

    /// Waits for every driver spawned so far. Test helper.
    pub async fn wait_idle(&self) {
        loop {
            let joined = {
                let mut guard = self.drivers.lock().expect("driver set poisoned");
                guard.try_join_next()
            };
            match joined {
                Some(_) => continue,
                None => {
                    let empty = self.drivers.lock().expect("driver set poisoned").is_empty();
                    if empty {
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    }
}

/// Task-level aggregate status per the admission-service contract.
fn aggregate_status(cancel_requested: bool, problems: &[ProblemRecord]) -> TaskStatus {
    if problems.iter().any(|p| !p.state.is_terminal()) {
        return TaskStatus::Running;
    }
    if problems.iter().all(|p| p.state == ProblemState::Completed) {
        return TaskStatus::Completed;
    }
    if cancel_requested && !problems.iter().any(|p| p.state == ProblemState::Completed) {
        return TaskStatus::Cancelled;
    }
    TaskStatus::Failed
}
