//! Named counting gates bounding global / per-user / per-stage / per-provider
//! work.
//!
//! The pool is the single source of truth for admission limits. Gates are
//! hot-reconfigurable: rebasing a gate leaves already-held permits valid and
//! only changes what new callers see. Fixed acquisition order (queue →
//! global → per-user → stage → llm.total → llm.provider) precludes
//! hold-and-wait cycles; callers must follow it.

use ojforge_models::{ConcurrencyConfig, GateStats, PipelineError, PipelineResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const GATE_GLOBAL: &str = "global_tasks";
pub const GATE_QUEUE: &str = "queue";
pub const GATE_FETCH: &str = "stage.fetch";
pub const GATE_UPLOAD: &str = "stage.upload";
pub const GATE_SOLVE: &str = "stage.solve";
pub const GATE_LLM_TOTAL: &str = "llm.total";
pub const GATE_COMPILE: &str = "compile";

#[derive(Debug, Default)]
struct GateState {
    max: u32,
    in_flight: u32,
    waiting: u32,
    total_acquired: u64,
}

/// One counting gate. A `tokio::sync::Semaphore` cannot be rebased downward
/// without invalidating held permits, so the counter is explicit.
#[derive(Debug)]
pub struct Gate {
    name: String,
    state: Mutex<GateState>,
    notify: Notify,
}

impl Gate {
    fn new(name: impl Into<String>, max: u32) -> Arc<Gate> {
        Arc::new(Gate {
            name: name.into(),
            state: Mutex::new(GateState {
                max,
                ..GateState::default()
            }),
            notify: Notify::new(),
        })
    }

    /// Suspends until a permit is available or `cancel` fires.
    async fn acquire(self: &Arc<Gate>, cancel: &CancellationToken) -> PipelineResult<GatePermit> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.state.lock().expect("gate mutex poisoned");
                if st.in_flight < st.max {
                    st.in_flight += 1;
                    st.total_acquired += 1;
                    return Ok(GatePermit {
                        gate: Arc::clone(self),
                    });
                }
                st.waiting += 1;
            }
            let woken = tokio::select! {
                _ = notified => true,
                _ = cancel.cancelled() => false,
            };
            {
                let mut st = self.state.lock().expect("gate mutex poisoned");
                st.waiting -= 1;
            }
            if !woken {
                return Err(PipelineError::Cancelled);
            }
        }
    }

    fn try_acquire(self: &Arc<Gate>) -> Option<GatePermit> {
        let mut st = self.state.lock().expect("gate mutex poisoned");
        if st.in_flight < st.max {
            st.in_flight += 1;
            st.total_acquired += 1;
            Some(GatePermit {
                gate: Arc::clone(self),
            })
        } else {
            None
        }
    }

    fn release(&self) {
        let mut st = self.state.lock().expect("gate mutex poisoned");
        st.in_flight = st.in_flight.saturating_sub(1);
        drop(st);
        self.notify.notify_one();
    }

    /// Rebase the limit. Held permits stay valid; waiters re-check.
    fn reconfigure(&self, new_max: u32) {
        let mut st = self.state.lock().expect("gate mutex poisoned");
        st.max = new_max;
        drop(st);
        self.notify.notify_waiters();
        // Covers a waiter that registered but has not polled yet.
        self.notify.notify_one();
    }

    fn stats(&self) -> GateStats {
        let st = self.state.lock().expect("gate mutex poisoned");
        GateStats {
            name: self.name.clone(),
            max: st.max,
            in_flight: st.in_flight,
            waiting: st.waiting,
            total_acquired: st.total_acquired,
        }
    }
}

/// RAII permit. Returned to its gate unconditionally on drop.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<Gate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// The process-wide gate table.
#[derive(Debug)]
pub struct GatePool {
    config: Mutex<ConcurrencyConfig>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

impl GatePool {
    pub fn new(config: ConcurrencyConfig) -> Arc<GatePool> {
        let mut gates = HashMap::new();
        let mut insert = |name: &str, max: u32| {
            gates.insert(name.to_string(), Gate::new(name, max));
        };
        insert(GATE_GLOBAL, config.max_global_tasks);
        insert(GATE_QUEUE, config.max_queue_size);
        insert(GATE_FETCH, config.max_fetch_concurrent);
        insert(GATE_UPLOAD, config.max_upload_concurrent);
        insert(GATE_SOLVE, config.max_solve_concurrent);
        insert(GATE_LLM_TOTAL, config.max_llm_concurrent);
        insert(GATE_COMPILE, config.max_compile_concurrent);
        Arc::new(GatePool {
            config: Mutex::new(config),
            gates: Mutex::new(gates),
        })
    }

    fn gate(&self, name: &str) -> Arc<Gate> {
        let mut gates = self.gates.lock().expect("gate table mutex poisoned");
        if let Some(g) = gates.get(name) {
            return Arc::clone(g);
        }
        // Dynamic per-user / per-provider gates materialize on first use.
        let cfg = self.config.lock().expect("config mutex poisoned");
        let max = if name.starts_with("user.") {
            cfg.max_tasks_per_user
        } else if name.starts_with("llm.") {
            cfg.max_llm_per_provider
        } else {
            debug!(gate = name, "unknown gate requested, treating as unbounded");
            u32::MAX
        };
        drop(cfg);
        let gate = Gate::new(name, max);
        gates.insert(name.to_string(), Arc::clone(&gate));
        gate
    }

    /// Suspends until a permit for `name` is available or `cancel` fires.
    pub async fn acquire(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<GatePermit> {
        self.gate(name).acquire(cancel).await
    }

    /// Non-blocking acquire, used for the bounded admission queue.
    pub fn try_acquire(&self, name: &str) -> Option<GatePermit> {
        self.gate(name).try_acquire()
    }

    pub fn user_gate_name(user_id: i64) -> String {
        format!("user.{user_id}")
    }

    pub fn provider_gate_name(provider: &str) -> String {
        format!("llm.{provider}")
    }

    pub fn config(&self) -> ConcurrencyConfig {
        *self.config.lock().expect("config mutex poisoned")
    }

    /// Apply a new limit table. Every existing gate, including dynamic
    /// per-user and per-provider gates, is rebased in place.
    pub fn reconfigure(&self, new: ConcurrencyConfig) {
        *self.config.lock().expect("config mutex poisoned") = new;
        let gates = self.gates.lock().expect("gate table mutex poisoned");
        for (name, gate) in gates.iter() {
            let max = match name.as_str() {
                GATE_GLOBAL => new.max_global_tasks,
                GATE_QUEUE => new.max_queue_size,
                GATE_FETCH => new.max_fetch_concurrent,
                GATE_UPLOAD => new.max_upload_concurrent,
                GATE_SOLVE => new.max_solve_concurrent,
                GATE_LLM_TOTAL => new.max_llm_concurrent,
                GATE_COMPILE => new.max_compile_concurrent,
                other if other.starts_with("user.") => new.max_tasks_per_user,
                other if other.starts_with("llm.") => new.max_llm_per_provider,
                _ => continue,
            };
            gate.reconfigure(max);
        }
    }

    /// Rebase a single gate by name.
    pub fn reconfigure_gate(&self, name: &str, new_max: u32) {
        self.gate(name).reconfigure(new_max);
    }

    pub fn stats(&self) -> Vec<GateStats> {
        let gates = self.gates.lock().expect("gate table mutex poisoned");
        let mut out: Vec<GateStats> = gates.values().map(|g| g.stats()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool_with(max_fetch: u32) -> Arc<GatePool> {
        let config = ConcurrencyConfig {
            max_fetch_concurrent: max_fetch,
            ..ConcurrencyConfig::default()
        };
        GatePool::new(config)
    }

    #[tokio::test]
    async fn permits_release_on_drop() {
        let pool = pool_with(2);
        let cancel = CancellationToken::new();

        let p1 = pool.acquire(GATE_FETCH, &cancel).await.unwrap();
        let _p2 = pool.acquire(GATE_FETCH, &cancel).await.unwrap();
        assert!(pool.try_acquire(GATE_FETCH).is_none());

        drop(p1);
        assert!(pool.try_acquire(GATE_FETCH).is_some());
    }

    #[tokio::test]
    async fn acquire_suspends_until_release() {
        let pool = pool_with(1);
        let cancel = CancellationToken::new();
        let held = pool.acquire(GATE_FETCH, &cancel).await.unwrap();

        let pool2 = Arc::clone(&pool);
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(GATE_FETCH, &cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let permit = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn cancellation_interrupts_waiters_quickly() {
        let pool = pool_with(1);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(GATE_FETCH, &cancel).await.unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter_cancel = CancellationToken::new();
        let wc = waiter_cancel.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(GATE_FETCH, &wc).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter_cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("cancel must unblock the waiter within 100ms")
            .unwrap();
        assert_eq!(result.unwrap_err(), PipelineError::Cancelled);
    }

    #[tokio::test]
    async fn reconfigure_keeps_held_permits() {
        let pool = pool_with(4);
        let cancel = CancellationToken::new();
        let _a = pool.acquire(GATE_FETCH, &cancel).await.unwrap();
        let _b = pool.acquire(GATE_FETCH, &cancel).await.unwrap();

        pool.reconfigure_gate(GATE_FETCH, 1);
        // Both held permits stay valid; new callers see the shrunk limit.
        assert!(pool.try_acquire(GATE_FETCH).is_none());

        drop(_a);
        drop(_b);
        assert!(pool.try_acquire(GATE_FETCH).is_some());
    }

    #[tokio::test]
    async fn reconfigure_wakes_waiters_on_grow() {
        let pool = pool_with(1);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(GATE_FETCH, &cancel).await.unwrap();

        let pool2 = Arc::clone(&pool);
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(GATE_FETCH, &cancel2).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.reconfigure_gate(GATE_FETCH, 2);
        let permit = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn user_gates_do_not_share_permits() {
        let pool = pool_with(10);
        let cancel = CancellationToken::new();
        let ga = GatePool::user_gate_name(1);
        let gb = GatePool::user_gate_name(2);
        let _a = pool.acquire(&ga, &cancel).await.unwrap();
        let _b = pool.acquire(&gb, &cancel).await.unwrap();
        let stats = pool.stats();
        let a = stats.iter().find(|s| s.name == ga).unwrap();
        let b = stats.iter().find(|s| s.name == gb).unwrap();
        assert_eq!(a.in_flight, 1);
        assert_eq!(b.in_flight, 1);
    }

    #[tokio::test]
    async fn gate_respects_limit_under_load() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let pool = pool_with(2);
        let cancel = CancellationToken::new();
        let current = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = pool.acquire(GATE_FETCH, &cancel).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
