use serde::{Deserialize, Serialize};

/// Named integer limits for the concurrency controller. Persisted as system
/// config and hot-applied on change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    pub max_global_tasks: u32,
    pub max_tasks_per_user: u32,
    pub max_fetch_concurrent: u32,
    pub max_upload_concurrent: u32,
    pub max_solve_concurrent: u32,
    pub max_llm_concurrent: u32,
    pub max_llm_per_provider: u32,
    pub max_compile_concurrent: u32,
    pub max_queue_size: u32,
    pub task_timeout_secs: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_global_tasks: 50,
            max_tasks_per_user: 10,
            max_fetch_concurrent: 10,
            max_upload_concurrent: 5,
            max_solve_concurrent: 5,
            max_llm_concurrent: 8,
            max_llm_per_provider: 4,
            max_compile_concurrent: 2,
            max_queue_size: 500,
            task_timeout_secs: 600,
        }
    }
}

impl ConcurrencyConfig {
    /// Named presets the admin surface can apply in one step.
    pub fn preset(name: &str) -> Option<ConcurrencyConfig> {
        let base = ConcurrencyConfig::default();
        Some(match name {
            "conservative" => ConcurrencyConfig {
                max_global_tasks: 20,
                max_tasks_per_user: 4,
                max_fetch_concurrent: 4,
                max_upload_concurrent: 2,
                max_solve_concurrent: 2,
                max_llm_concurrent: 4,
                max_llm_per_provider: 2,
                max_compile_concurrent: 1,
                ..base
            },
            "balanced" => base,
            "aggressive" => ConcurrencyConfig {
                max_global_tasks: 100,
                max_tasks_per_user: 20,
                max_fetch_concurrent: 20,
                max_upload_concurrent: 10,
                max_solve_concurrent: 10,
                max_llm_concurrent: 16,
                max_llm_per_provider: 8,
                max_compile_concurrent: 4,
                ..base
            },
            _ => return None,
        })
    }
}

/// Live statistics for one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateStats {
    pub name: String,
    pub max: u32,
    pub in_flight: u32,
    pub waiting: u32,
    pub total_acquired: u64,
}

/// Aggregated queue counters for the admin surface.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

/// Task/user counters for `system.stats`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SystemStats {
    pub tasks_total: u64,
    pub tasks_success: u64,
    pub tasks_running: u64,
    pub tasks_failed: u64,
    pub tasks_pending: u64,
    pub users_total: u64,
    pub users_active: u64,
}
