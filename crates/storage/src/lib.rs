//! Thin repository over the embedded relational store.
//!
//! Mirrors the backend-trait pattern of the platform storage layer: a
//! `Repository` trait with an in-memory backend for tests and a SQLite
//! backend for the real process. Credentials cross this boundary encrypted;
//! no other component sees plaintext blobs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ojforge_models::{
    Paging, ProblemRecord, ProblemState, QueueStats, SystemStats, TaskFilter, TaskListPage,
    TaskRecord, TaskStatus,
};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

mod encryption;
mod rows;
mod sqlite;

pub use encryption::CredentialCipher;
pub use sqlite::SqliteRepository;

/// Persisted user account.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub is_admin: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Storage backend trait. All writes for a single problem are totally
/// ordered through the owner CAS (`owner_worker`).
#[async_trait]
pub trait Repository: Send + Sync {
    // Users
    async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        salt: &str,
        is_admin: bool,
    ) -> Result<i64>;
    async fn get_user_by_name(&self, username: &str) -> Result<Option<UserRecord>>;
    async fn get_user(&self, id: i64) -> Result<Option<UserRecord>>;

    // Tasks
    async fn insert_task(&self, task: &TaskRecord) -> Result<()>;
    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>>;
    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()>;
    async fn list_tasks(
        &self,
        user_id: i64,
        filter: &TaskFilter,
        paging: Paging,
    ) -> Result<TaskListPage>;
    async fn delete_task(&self, id: Uuid) -> Result<()>;

    // Problems
    async fn insert_problem(&self, problem: &ProblemRecord) -> Result<()>;
    async fn get_problem(&self, id: Uuid) -> Result<Option<ProblemRecord>>;
    async fn problems_for_task(&self, task_id: Uuid) -> Result<Vec<ProblemRecord>>;
    /// Take ownership of an unowned problem row. Returns false if another
    /// runner already owns it.
    async fn claim_problem(&self, id: Uuid, owner: &str) -> Result<bool>;
    /// Compare-and-swap update: applies only while `owner` matches the row.
    async fn update_problem(&self, problem: &ProblemRecord, owner: &str) -> Result<bool>;
    async fn release_problem(&self, id: Uuid, owner: &str) -> Result<()>;

    // Per-user adapter credentials (encrypted at rest)
    async fn save_adapter_config(
        &self,
        user_id: i64,
        adapter: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<()>;
    async fn get_adapter_config(
        &self,
        user_id: i64,
        adapter: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;

    // Provider credentials (encrypted at rest)
    async fn save_provider_credentials(
        &self,
        provider: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<()>;
    async fn get_provider_credentials(
        &self,
        provider: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;

    // System config
    async fn get_system_config(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn set_system_config(&self, key: &str, value: &serde_json::Value) -> Result<()>;

    // Activity log
    async fn log_activity(&self, user_id: i64, kind: &str, payload: serde_json::Value)
        -> Result<()>;

    // Stats
    async fn queue_stats(&self) -> Result<QueueStats>;
    async fn system_stats(&self) -> Result<SystemStats>;
}

fn count_queue(problems: impl Iterator<Item = ProblemState>) -> QueueStats {
    let mut stats = QueueStats::default();
    for state in problems {
        stats.total += 1;
        match state {
            ProblemState::Pending => stats.pending += 1,
            ProblemState::Completed => stats.completed += 1,
            s if s.is_terminal() => stats.failed += 1,
            _ => stats.running += 1,
        }
    }
    stats
}

/// In-memory backend for tests and fallback, following the platform's
/// memory storage layout.
pub struct MemoryRepository {
    cipher: CredentialCipher,
    users: tokio::sync::RwLock<HashMap<i64, UserRecord>>,
    next_user_id: std::sync::atomic::AtomicI64,
    tasks: tokio::sync::RwLock<HashMap<Uuid, TaskRecord>>,
    problems: tokio::sync::RwLock<HashMap<Uuid, ProblemRecord>>,
    adapter_configs: tokio::sync::RwLock<HashMap<(i64, String), String>>,
    provider_credentials: tokio::sync::RwLock<HashMap<String, String>>,
    system_config: tokio::sync::RwLock<HashMap<String, serde_json::Value>>,
    activity: tokio::sync::RwLock<Vec<(i64, String, serde_json::Value, DateTime<Utc>)>>,
}

impl MemoryRepository {
    pub fn new(cipher: CredentialCipher) -> Self {
        Self {
            cipher,
            users: Default::default(),
            next_user_id: std::sync::atomic::AtomicI64::new(1),
            tasks: Default::default(),
            problems: Default::default(),
            adapter_configs: Default::default(),
            provider_credentials: Default::default(),
            system_config: Default::default(),
            activity: Default::default(),
        }
    }

    pub async fn activity_count(&self) -> usize {
        self.activity.read().await.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        salt: &str,
        is_admin: bool,
    ) -> Result<i64> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.username == username) {
            anyhow::bail!("user already exists: {username}");
        }
        let id = self
            .next_user_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        users.insert(
            id,
            UserRecord {
                id,
                username: username.to_string(),
                password_hash: password_hash.to_string(),
                salt: salt.to_string(),
                is_admin,
                active: true,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get_user_by_name(&self, username: &str) -> Result<Option<UserRecord>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<()> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("task not found: {id}"))?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn list_tasks(
        &self,
        user_id: i64,
        filter: &TaskFilter,
        paging: Paging,
    ) -> Result<TaskListPage> {
        let tasks = self.tasks.read().await;
        let mut filtered: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| t.user_id == user_id)
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        filtered.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = filtered.len() as u64;
        let start = paging.offset() as usize;
        let page: Vec<TaskRecord> = filtered
            .into_iter()
            .skip(start)
            .take(paging.per_page as usize)
            .collect();
        Ok(TaskListPage {
            tasks: page,
            total,
            page: paging.page,
            per_page: paging.per_page,
        })
    }

    async fn delete_task(&self, id: Uuid) -> Result<()> {
        self.tasks.write().await.remove(&id);
        self.problems.write().await.retain(|_, p| p.task_id != id);
        Ok(())
    }

    async fn insert_problem(&self, problem: &ProblemRecord) -> Result<()> {
        self.problems
            .write()
            .await
            .insert(problem.id, problem.clone());
        Ok(())
    }

    async fn get_problem(&self, id: Uuid) -> Result<Option<ProblemRecord>> {
        Ok(self.problems.read().await.get(&id).cloned())
    }

    async fn problems_for_task(&self, task_id: Uuid) -> Result<Vec<ProblemRecord>> {
        let mut out: Vec<ProblemRecord> = self
            .problems
            .read()
            .await
            .values()
            .filter(|p| p.task_id == task_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn claim_problem(&self, id: Uuid, owner: &str) -> Result<bool> {
        let mut problems = self.problems.write().await;
        let Some(p) = problems.get_mut(&id) else {
            return Ok(false);
        };
        if p.owner_worker.is_some() {
            return Ok(false);
        }
        p.owner_worker = Some(owner.to_string());
        p.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_problem(&self, problem: &ProblemRecord, owner: &str) -> Result<bool> {
        let mut problems = self.problems.write().await;
        let Some(p) = problems.get_mut(&problem.id) else {
            return Ok(false);
        };
        if p.owner_worker.as_deref() != Some(owner) {
            return Ok(false);
        }
        let mut updated = problem.clone();
        updated.updated_at = Utc::now();
        updated.owner_worker = p.owner_worker.clone();
        *p = updated;
        Ok(true)
    }

    async fn release_problem(&self, id: Uuid, owner: &str) -> Result<()> {
        let mut problems = self.problems.write().await;
        if let Some(p) = problems.get_mut(&id) {
            if p.owner_worker.as_deref() == Some(owner) {
                p.owner_worker = None;
                p.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn save_adapter_config(
        &self,
        user_id: i64,
        adapter: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<()> {
        let blob = self.cipher.encrypt_fields(fields)?;
        self.adapter_configs
            .write()
            .await
            .insert((user_id, adapter.to_string()), blob);
        Ok(())
    }

    async fn get_adapter_config(
        &self,
        user_id: i64,
        adapter: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let configs = self.adapter_configs.read().await;
        match configs.get(&(user_id, adapter.to_string())) {
            Some(blob) => Ok(Some(self.cipher.decrypt_fields(blob)?)),
            None => Ok(None),
        }
    }

    async fn save_provider_credentials(
        &self,
        provider: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<()> {
        let blob = self.cipher.encrypt_fields(fields)?;
        self.provider_credentials
            .write()
            .await
            .insert(provider.to_string(), blob);
        Ok(())
    }

    async fn get_provider_credentials(
        &self,
        provider: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let creds = self.provider_credentials.read().await;
        match creds.get(provider) {
            Some(blob) => Ok(Some(self.cipher.decrypt_fields(blob)?)),
            None => Ok(None),
        }
    }

    async fn get_system_config(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.system_config.read().await.get(key).cloned())
    }

    async fn set_system_config(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.system_config
            .write()
            .await
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn log_activity(
        &self,
        user_id: i64,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.activity
            .write()
            .await
            .push((user_id, kind.to_string(), payload, Utc::now()));
        Ok(())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let problems = self.problems.read().await;
        Ok(count_queue(problems.values().map(|p| p.state)))
    }

    async fn system_stats(&self) -> Result<SystemStats> {
        let tasks = self.tasks.read().await;
        let users = self.users.read().await;
        let mut stats = SystemStats {
            users_total: users.len() as u64,
            users_active: users.values().filter(|u| u.active).count() as u64,
            ..SystemStats::default()
        };
        for t in tasks.values() {
            stats.tasks_total += 1;
            match t.status {
                TaskStatus::Completed => stats.tasks_success += 1,
                TaskStatus::Running => stats.tasks_running += 1,
                TaskStatus::Failed | TaskStatus::Cancelled => stats.tasks_failed += 1,
                TaskStatus::Pending => stats.tasks_pending += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ojforge_models::{RetryCounts, StageSet};

    fn problem(task_id: Uuid, user_id: i64, pid: &str) -> ProblemRecord {
        ProblemRecord {
            id: Uuid::new_v4(),
            task_id,
            user_id,
            pid: pid.to_string(),
            display_id: pid.to_string(),
            source_adapter: "shsoj".into(),
            target_adapter: "mock".into(),
            state: ProblemState::Pending,
            retry_counts: RetryCounts::default(),
            last_error: None,
            real_id: None,
            uploaded_url: None,
            owner_worker: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let repo = MemoryRepository::new(CredentialCipher::from_secret("t"));
        let p = problem(Uuid::new_v4(), 1, "shsoj_1001");
        repo.insert_problem(&p).await.unwrap();

        assert!(repo.claim_problem(p.id, "worker-a").await.unwrap());
        assert!(!repo.claim_problem(p.id, "worker-b").await.unwrap());

        repo.release_problem(p.id, "worker-a").await.unwrap();
        assert!(repo.claim_problem(p.id, "worker-b").await.unwrap());
    }

    #[tokio::test]
    async fn update_requires_matching_owner() {
        let repo = MemoryRepository::new(CredentialCipher::from_secret("t"));
        let mut p = problem(Uuid::new_v4(), 1, "shsoj_1001");
        repo.insert_problem(&p).await.unwrap();
        repo.claim_problem(p.id, "worker-a").await.unwrap();

        p.state = ProblemState::Fetching;
        assert!(!repo.update_problem(&p, "worker-b").await.unwrap());
        assert!(repo.update_problem(&p, "worker-a").await.unwrap());
        assert_eq!(
            repo.get_problem(p.id).await.unwrap().unwrap().state,
            ProblemState::Fetching
        );
    }

    #[tokio::test]
    async fn adapter_configs_are_user_scoped() {
        let repo = MemoryRepository::new(CredentialCipher::from_secret("t"));
        let mut a = BTreeMap::new();
        a.insert("domain".to_string(), "alpha".to_string());
        let mut b = BTreeMap::new();
        b.insert("domain".to_string(), "beta".to_string());

        repo.save_adapter_config(1, "hydrooj", &a).await.unwrap();
        repo.save_adapter_config(2, "hydrooj", &b).await.unwrap();

        assert_eq!(repo.get_adapter_config(1, "hydrooj").await.unwrap(), Some(a));
        assert_eq!(repo.get_adapter_config(2, "hydrooj").await.unwrap(), Some(b));
        assert_eq!(repo.get_adapter_config(3, "hydrooj").await.unwrap(), None);
    }

    #[tokio::test]
    async fn queue_stats_bucket_states() {
        let repo = MemoryRepository::new(CredentialCipher::from_secret("t"));
        let task = Uuid::new_v4();
        for (i, state) in [
            ProblemState::Pending,
            ProblemState::Fetching,
            ProblemState::Completed,
            ProblemState::FailedGen,
            ProblemState::Cancelled,
        ]
        .into_iter()
        .enumerate()
        {
            let mut p = problem(task, 1, &format!("shsoj_{i}"));
            p.state = state;
            repo.insert_problem(&p).await.unwrap();
        }
        let stats = repo.queue_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.total, 5);
    }

    #[tokio::test]
    async fn task_listing_filters_and_pages() {
        let repo = MemoryRepository::new(CredentialCipher::from_secret("t"));
        for i in 0..5 {
            repo.insert_task(&TaskRecord {
                id: Uuid::new_v4(),
                user_id: 1,
                stages: StageSet::default(),
                target_adapter: "mock".into(),
                llm_provider: None,
                status: if i % 2 == 0 {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                },
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        }
        let page = repo
            .list_tasks(
                1,
                &TaskFilter {
                    status: Some(TaskStatus::Completed),
                    search: None,
                },
                Paging {
                    page: 1,
                    per_page: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.tasks.len(), 2);
    }
}
