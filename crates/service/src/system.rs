//! Admin-facing operations: concurrency control, provider and adapter
//! configuration, system statistics.

use crate::AppState;
use anyhow::{bail, Result};
use ojforge_adapters::AdapterSummary;
use ojforge_llm::TestReport;
use ojforge_models::{ConcurrencyConfig, GateStats, ProviderSpec, QueueStats, SystemStats};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const CONCURRENCY_CONFIG_KEY: &str = "concurrency_config";

pub struct SystemService {
    state: Arc<AppState>,
}

impl SystemService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    // ---- concurrency -----------------------------------------------------

    pub fn concurrency_get(&self) -> ConcurrencyConfig {
        self.state.gates.config()
    }

    /// Applies and persists a new limit table; live gates are rebased.
    pub async fn concurrency_set(&self, config: ConcurrencyConfig) -> Result<()> {
        self.state.gates.reconfigure(config);
        self.state
            .repo
            .set_system_config(CONCURRENCY_CONFIG_KEY, &serde_json::to_value(config)?)
            .await?;
        info!("concurrency limits updated");
        Ok(())
    }

    pub async fn apply_preset(&self, name: &str) -> Result<ConcurrencyConfig> {
        let Some(config) = ConcurrencyConfig::preset(name) else {
            bail!("unknown concurrency preset: {name}");
        };
        self.concurrency_set(config).await?;
        Ok(config)
    }

    /// Restores persisted limits at boot; missing config keeps defaults.
    pub async fn load_persisted_concurrency(&self) -> Result<()> {
        if let Some(value) = self
            .state
            .repo
            .get_system_config(CONCURRENCY_CONFIG_KEY)
            .await?
        {
            let config: ConcurrencyConfig = serde_json::from_value(value)?;
            self.state.gates.reconfigure(config);
            info!("restored persisted concurrency limits");
        }
        Ok(())
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.state.repo.queue_stats().await
    }

    pub fn gate_stats(&self) -> Vec<GateStats> {
        self.state.gates.stats()
    }

    pub async fn system_stats(&self) -> Result<SystemStats> {
        self.state.repo.system_stats().await
    }

    // ---- providers -------------------------------------------------------

    pub fn providers_list(&self) -> &'static [ProviderSpec] {
        ojforge_llm::providers()
    }

    pub async fn providers_save(
        &self,
        is_admin: bool,
        provider_id: &str,
        fields: BTreeMap<String, String>,
    ) -> Result<()> {
        if !is_admin {
            bail!("provider credentials are admin-only");
        }
        if ojforge_llm::provider(provider_id).is_none() {
            bail!("unknown provider: {provider_id}");
        }
        self.state
            .repo
            .save_provider_credentials(provider_id, &fields)
            .await
    }

    pub async fn providers_test(&self, provider_id: &str, full: bool) -> TestReport {
        self.state.llm.test(provider_id, full).await
    }

    // ---- adapters --------------------------------------------------------

    pub fn adapters_list(&self) -> Vec<AdapterSummary> {
        self.state.registry.summaries()
    }

    pub async fn adapters_save_config(
        &self,
        user_id: i64,
        adapter: &str,
        fields: BTreeMap<String, String>,
    ) -> Result<()> {
        let Some(handle) = self.state.registry.get(adapter) else {
            bail!("unknown adapter: {adapter}");
        };
        for field in handle.config_schema().iter().filter(|f| f.required) {
            if fields.get(&field.field).map_or(true, |v| v.is_empty()) {
                bail!("missing required field: {}", field.field);
            }
        }
        self.state
            .repo
            .save_adapter_config(user_id, adapter, &fields)
            .await?;
        self.state
            .repo
            .log_activity(
                user_id,
                "save_config",
                serde_json::json!({ "adapter": adapter }),
            )
            .await
    }
}
